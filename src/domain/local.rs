//! Per-accelerator subdomain: interior extents plus a radius-thick halo
//! shell on every face.
//!
//! Raw (allocated) coordinates span `extents + 2*radius` per axis; the
//! interior is the `[radius, extents+radius)` box. For a direction vector
//! `v` the send box sits just inside the interior on the `+v` side and the
//! matching halo box just outside it; sending toward `v` fills the peer's
//! halo box for `-v`.

use std::sync::Arc;

use bytemuck::Pod;

use crate::grid::dim3::Dim3;
use crate::halo_error::HaloError;
use crate::memory::array::DeviceArray;
use crate::runtime::{AllocMode, DevicePtr, DeviceRuntime};

/// An axis-aligned box in raw (halo-inclusive) coordinates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub origin: Dim3,
    pub extent: Dim3,
}

impl Region {
    /// Number of cells in the box.
    #[inline]
    pub fn cells(&self) -> i64 {
        self.extent.flatten()
    }

    /// Byte offset and length of each x-contiguous row of this box inside
    /// an array of extent `raw` whose cells are `elem_size` bytes. Rows are
    /// yielded y-then-z, matching the packing order of every transport.
    pub fn row_spans(self, raw: Dim3, elem_size: usize) -> impl Iterator<Item = (usize, usize)> {
        let Region { origin, extent } = self;
        let row_bytes = extent.x as usize * elem_size;
        (0..extent.z).flat_map(move |z| {
            (0..extent.y).map(move |y| {
                let pos = Dim3::new(origin.x, origin.y + y, origin.z + z);
                (pos.to_linear(raw) as usize * elem_size, row_bytes)
            })
        })
    }
}

/// The 3D box of grid cells owned by one accelerator, with one
/// device-resident array per registered data channel.
#[derive(Debug)]
pub struct LocalDomain {
    extents: Dim3,
    radius: usize,
    device: usize,
    rt: Arc<DeviceRuntime>,
    elem_sizes: Vec<usize>,
    arrays: Vec<DeviceArray>,
    realized: bool,
}

impl LocalDomain {
    pub fn new(extents: Dim3, device: usize, radius: usize, rt: Arc<DeviceRuntime>) -> Self {
        Self {
            extents,
            radius,
            device,
            rt,
            elem_sizes: Vec::new(),
            arrays: Vec::new(),
            realized: false,
        }
    }

    /// Declares a data channel of `elem_size`-byte cells. Returns the
    /// channel's insertion index. Only valid before [`LocalDomain::realize`].
    pub fn register_data(&mut self, elem_size: usize) -> Result<usize, HaloError> {
        if self.realized {
            return Err(HaloError::RegisterAfterRealize);
        }
        self.elem_sizes.push(elem_size);
        Ok(self.elem_sizes.len() - 1)
    }

    /// Allocates one array per channel, sized `extents + 2*radius` on each
    /// axis, on the owned accelerator. Partially allocated arrays are
    /// released if any allocation fails.
    pub fn realize(&mut self, mode: AllocMode) -> Result<(), HaloError> {
        if self.realized {
            return Err(HaloError::AlreadyRealized);
        }
        let raw = self.raw_size();
        for &elem_size in &self.elem_sizes {
            let mut arr = DeviceArray::new(Arc::clone(&self.rt), self.device, elem_size, mode);
            if let Err(e) = arr.resize(raw) {
                self.arrays.clear();
                return Err(e);
            }
            self.arrays.push(arr);
        }
        self.realized = true;
        Ok(())
    }

    #[inline]
    pub fn extents(&self) -> Dim3 {
        self.extents
    }

    #[inline]
    pub fn radius(&self) -> usize {
        self.radius
    }

    /// Physical accelerator id.
    #[inline]
    pub fn device(&self) -> usize {
        self.device
    }

    pub fn runtime(&self) -> &Arc<DeviceRuntime> {
        &self.rt
    }

    /// Full allocated extent including halos on both sides of every axis.
    #[inline]
    pub fn raw_size(&self) -> Dim3 {
        self.extents + Dim3::splat(2 * self.radius as i64)
    }

    #[inline]
    pub fn num_channels(&self) -> usize {
        self.elem_sizes.len()
    }

    #[inline]
    pub fn elem_size(&self, channel: usize) -> usize {
        self.elem_sizes[channel]
    }

    /// Base device pointer of a channel's array.
    pub fn channel_ptr(&self, channel: usize) -> Result<DevicePtr, HaloError> {
        self.arrays
            .get(channel)
            .and_then(|a| a.ptr())
            .ok_or_else(|| HaloError::Memory(format!("channel {channel} is not realized")))
    }

    /// The authoritative non-halo box.
    pub fn interior_region(&self) -> Region {
        Region {
            origin: Dim3::splat(self.radius as i64),
            extent: self.extents,
        }
    }

    /// Box read when sending toward `dir`: flush against the interior face
    /// on the `+dir` side. Axes with `dir_i == 0` span the whole interior.
    pub fn send_region(&self, dir: Dim3) -> Region {
        let r = self.radius as i64;
        let span = |v: i64, ext: i64| match v {
            1 => (ext, r),
            0 => (r, ext),
            _ => (r, r),
        };
        let (ox, ex) = span(dir.x, self.extents.x);
        let (oy, ey) = span(dir.y, self.extents.y);
        let (oz, ez) = span(dir.z, self.extents.z);
        Region {
            origin: Dim3::new(ox, oy, oz),
            extent: Dim3::new(ex, ey, ez),
        }
    }

    /// Halo box on the `+dir` side, written when the `+dir` neighbor sends
    /// toward `-dir`.
    pub fn recv_region(&self, dir: Dim3) -> Region {
        let r = self.radius as i64;
        let span = |v: i64, ext: i64| match v {
            1 => (r + ext, r),
            0 => (r, ext),
            _ => (0, r),
        };
        let (ox, ex) = span(dir.x, self.extents.x);
        let (oy, ey) = span(dir.y, self.extents.y);
        let (oz, ez) = span(dir.z, self.extents.z);
        Region {
            origin: Dim3::new(ox, oy, oz),
            extent: Dim3::new(ex, ey, ez),
        }
    }

    /// Writes `data` over `region`, row-major with x fastest.
    pub fn write_region<T: Pod>(
        &self,
        channel: usize,
        region: Region,
        data: &[T],
    ) -> Result<(), HaloError> {
        let elem_size = self.check_elem::<T>(channel)?;
        if data.len() as i64 != region.cells() {
            return Err(HaloError::Memory(format!(
                "write of {} cells into a region of {}",
                data.len(),
                region.cells()
            )));
        }
        let base = self.channel_ptr(channel)?;
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut cursor = 0;
        for (off, len) in region.row_spans(self.raw_size(), elem_size) {
            self.rt
                .upload(base.byte_add(off), &bytes[cursor..cursor + len])?;
            cursor += len;
        }
        Ok(())
    }

    /// Reads `region` into a vector, row-major with x fastest.
    pub fn read_region<T: Pod>(&self, channel: usize, region: Region) -> Result<Vec<T>, HaloError> {
        let elem_size = self.check_elem::<T>(channel)?;
        let base = self.channel_ptr(channel)?;
        let mut bytes = Vec::with_capacity(region.cells() as usize * elem_size);
        for (off, len) in region.row_spans(self.raw_size(), elem_size) {
            bytes.extend_from_slice(&self.rt.download(base.byte_add(off), len)?);
        }
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    pub fn write_interior<T: Pod>(&self, channel: usize, data: &[T]) -> Result<(), HaloError> {
        self.write_region(channel, self.interior_region(), data)
    }

    pub fn read_interior<T: Pod>(&self, channel: usize) -> Result<Vec<T>, HaloError> {
        self.read_region(channel, self.interior_region())
    }

    /// The whole raw array, halos included.
    pub fn read_all<T: Pod>(&self, channel: usize) -> Result<Vec<T>, HaloError> {
        self.read_region(
            channel,
            Region {
                origin: Dim3::ZERO,
                extent: self.raw_size(),
            },
        )
    }

    fn check_elem<T: Pod>(&self, channel: usize) -> Result<usize, HaloError> {
        let elem_size = self.elem_size(channel);
        if elem_size != std::mem::size_of::<T>() {
            return Err(HaloError::Memory(format!(
                "channel {channel} holds {elem_size}-byte cells, accessed as {}-byte values",
                std::mem::size_of::<T>()
            )));
        }
        Ok(elem_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(extents: Dim3, radius: usize) -> LocalDomain {
        let rt = Arc::new(DeviceRuntime::new(1));
        LocalDomain::new(extents, 0, radius, rt)
    }

    #[test]
    fn regions_tile_the_shell() {
        use crate::grid::direction::DIRECTIONS;
        let d = domain(Dim3::new(4, 5, 6), 2);
        let raw = d.raw_size();
        assert_eq!(raw, Dim3::new(8, 9, 10));

        // halo cells = raw volume minus interior volume; the 26 halo boxes
        // must tile them exactly
        let halo_cells: i64 = DIRECTIONS.iter().map(|&v| d.recv_region(v).cells()).sum();
        assert_eq!(halo_cells, raw.flatten() - d.extents().flatten());

        // send boxes live inside the interior, recv boxes outside it
        let int = d.interior_region();
        for &v in &DIRECTIONS {
            let s = d.send_region(v);
            assert!(s.origin.x >= int.origin.x && s.origin.y >= int.origin.y);
            let s_end = s.origin + s.extent;
            let int_end = int.origin + int.extent;
            assert!(s_end.x <= int_end.x && s_end.y <= int_end.y && s_end.z <= int_end.z);
            assert_eq!(s.extent, d.recv_region(v).extent);
        }
    }

    #[test]
    fn face_regions_sit_flush_with_the_interior() {
        let d = domain(Dim3::new(4, 4, 4), 1);
        let plus_x = d.send_region(Dim3::new(1, 0, 0));
        assert_eq!(plus_x.origin, Dim3::new(4, 1, 1));
        assert_eq!(plus_x.extent, Dim3::new(1, 4, 4));

        let minus_x_halo = d.recv_region(Dim3::new(-1, 0, 0));
        assert_eq!(minus_x_halo.origin, Dim3::new(0, 1, 1));
        assert_eq!(minus_x_halo.extent, Dim3::new(1, 4, 4));

        let corner = d.recv_region(Dim3::new(1, 1, 1));
        assert_eq!(corner.origin, Dim3::new(5, 5, 5));
        assert_eq!(corner.extent, Dim3::splat(1));
    }

    #[test]
    fn register_then_realize_then_access() {
        let mut d = domain(Dim3::splat(3), 1);
        let ch = d.register_data(std::mem::size_of::<f64>()).unwrap();
        d.realize(AllocMode::Device).unwrap();
        assert!(matches!(
            d.register_data(4),
            Err(HaloError::RegisterAfterRealize)
        ));
        assert!(matches!(d.realize(AllocMode::Device), Err(HaloError::AlreadyRealized)));

        let interior: Vec<f64> = (0..27).map(|i| i as f64).collect();
        d.write_interior(ch, &interior).unwrap();
        assert_eq!(d.read_interior::<f64>(ch).unwrap(), interior);

        // halos still hold their allocation-time zeros
        let all = d.read_all::<f64>(ch).unwrap();
        assert_eq!(all.len(), 5 * 5 * 5);
        assert_eq!(all[0], 0.0);
    }

    #[test]
    fn typed_access_checks_element_size() {
        let mut d = domain(Dim3::splat(2), 1);
        let ch = d.register_data(std::mem::size_of::<f64>()).unwrap();
        d.realize(AllocMode::Device).unwrap();
        assert!(d.read_interior::<f32>(ch).is_err());
    }
}
