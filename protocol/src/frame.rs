use base64::{engine::general_purpose::STANDARD, Engine as _};

const BYTES_PER_PIXEL: usize = 4;

/// Largest frame (and tile) this node will allocate, 4096×4096
pub const MAX_FRAME_PIXELS: u64 = 4096 * 4096;

/// Byte length of a `width`×`height` RGBA buffer, `None` past [`MAX_FRAME_PIXELS`].
fn byte_len(width: u32, height: u32) -> Option<usize> {
    let pixels = u64::from(width).checked_mul(u64::from(height))?;
    if pixels > MAX_FRAME_PIXELS {
        return None;
    }
    usize::try_from(pixels).ok()?.checked_mul(BYTES_PER_PIXEL)
}

/// A raw RGBA8 image. Tiles travel as base64 of their pixel bytes, optionally
/// wrapped in a `data:` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Frame {
    /// A transparent frame, or `None` when it would exceed [`MAX_FRAME_PIXELS`].
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width,
            height,
            pixels: vec![0; byte_len(width, height)?],
        })
    }

    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Option<Self> {
        let mut frame = Self::new(width, height)?;
        for px in frame.pixels.chunks_exact_mut(BYTES_PER_PIXEL) {
            px.copy_from_slice(&rgba);
        }
        Some(frame)
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        let mut out = [0u8; 4];
        out.copy_from_slice(&self.pixels[i..i + BYTES_PER_PIXEL]);
        Some(out)
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let i = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        self.pixels[i..i + BYTES_PER_PIXEL].copy_from_slice(&rgba);
    }

    /// Copies `tile` into this frame with its top-left corner at `(x, y)`,
    /// clipping whatever falls outside.
    pub fn blit(&mut self, tile: &Frame, x: u32, y: u32) {
        if x >= self.width || y >= self.height {
            return;
        }
        let cols = tile.width.min(self.width - x) as usize;
        let rows = tile.height.min(self.height - y) as usize;
        let row_bytes = cols * BYTES_PER_PIXEL;
        for row in 0..rows {
            let src = row * tile.width as usize * BYTES_PER_PIXEL;
            let dst = ((y as usize + row) * self.width as usize + x as usize) * BYTES_PER_PIXEL;
            self.pixels[dst..dst + row_bytes].copy_from_slice(&tile.pixels[src..src + row_bytes]);
        }
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.pixels)
    }

    /// Decodes tile data of a known size. Returns `None` when the payload is
    /// not base64 or its length does not match `width * height`.
    pub fn from_base64(data: &str, width: u32, height: u32) -> Option<Self> {
        let encoded = match data.split_once(";base64,") {
            Some((prefix, rest)) if prefix.starts_with("data:") => rest,
            _ => data,
        };
        let expected = byte_len(width, height)?;
        let pixels = STANDARD.decode(encoded.trim()).ok()?;
        if pixels.len() != expected {
            return None;
        }
        Some(Self { width, height, pixels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blit_places_tile_at_offset() {
        let mut canvas = Frame::new(4, 4).unwrap();
        let tile = Frame::filled(2, 2, [255, 0, 0, 255]).unwrap();
        canvas.blit(&tile, 2, 2);
        assert_eq!(canvas.pixel(2, 2), Some([255, 0, 0, 255]));
        assert_eq!(canvas.pixel(3, 3), Some([255, 0, 0, 255]));
        assert_eq!(canvas.pixel(1, 1), Some([0, 0, 0, 0]));
    }

    #[test]
    fn test_blit_clips_overhang() {
        let mut canvas = Frame::new(3, 3).unwrap();
        let tile = Frame::filled(2, 2, [9, 9, 9, 9]).unwrap();
        canvas.blit(&tile, 2, 2);
        assert_eq!(canvas.pixel(2, 2), Some([9, 9, 9, 9]));
        canvas.blit(&tile, 5, 0);
    }

    #[test]
    fn test_decode_data_url_and_size_check() {
        let tile = Frame::filled(2, 1, [1, 2, 3, 4]).unwrap();
        let url = format!("data:image/x-rgba;base64,{}", tile.to_base64());
        assert_eq!(Frame::from_base64(&url, 2, 1), Some(tile.clone()));
        assert_eq!(Frame::from_base64(&tile.to_base64(), 3, 1), None);
        assert_eq!(Frame::from_base64("not base64!", 2, 1), None);
    }

    #[test]
    fn test_oversized_frames_are_refused() {
        assert_eq!(Frame::new(u32::MAX, u32::MAX), None);
        assert_eq!(Frame::new(60_000, 60_000), None);
        assert_eq!(Frame::new(4097, 4096), None);
        assert_eq!(Frame::new(4096, 4096).map(|f| f.pixels.len()), Some(4096 * 4096 * 4));
        assert_eq!(Frame::from_base64("AAAA", u32::MAX, u32::MAX), None);
    }
}
