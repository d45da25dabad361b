//! ARGB framebuffer
//!
//! Pages paint into a [`Framebuffer`]; drivers convert it to whatever the
//! hardware wants. Older monochrome models need the packed 1-bit layout
//! produced by [`Framebuffer::to_monochrome`].

/// 32-bit ARGB raster surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framebuffer {
    width: usize,
    height: usize,
    pixels: Vec<u32>,
}

impl Framebuffer {
    /// Create a new framebuffer filled with opaque black.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0xFF00_0000; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    /// Fill the whole surface with one ARGB colour.
    pub fn clear(&mut self, argb: u32) {
        self.pixels.fill(argb);
    }

    pub fn set_pixel(&mut self, x: usize, y: usize, argb: u32) {
        if x < self.width && y < self.height {
            self.pixels[y * self.width + x] = argb;
        }
    }

    pub fn get_pixel(&self, x: usize, y: usize) -> u32 {
        if x < self.width && y < self.height {
            self.pixels[y * self.width + x]
        } else {
            0
        }
    }

    pub fn fill_rect(&mut self, x: usize, y: usize, w: usize, h: usize, argb: u32) {
        for yy in y..(y + h).min(self.height) {
            for xx in x..(x + w).min(self.width) {
                self.pixels[yy * self.width + xx] = argb;
            }
        }
    }

    /// Alpha-blend `other` over this surface. `alpha` is 0.0 (this surface
    /// untouched) to 1.0 (fully `other`). Used by cross-fade transitions.
    pub fn blend(&mut self, other: &Framebuffer, alpha: f32) {
        let alpha = alpha.clamp(0.0, 1.0);
        for (dst, src) in self.pixels.iter_mut().zip(other.pixels.iter()) {
            *dst = blend_argb(*dst, *src, alpha);
        }
    }

    /// Perceived luminance of a pixel, 0-255.
    fn luminance(argb: u32) -> u8 {
        let r = ((argb >> 16) & 0xFF) as u32;
        let g = ((argb >> 8) & 0xFF) as u32;
        let b = (argb & 0xFF) as u32;
        // Rec. 601 weights, integer approximation
        ((r * 299 + g * 587 + b * 114) / 1000) as u8
    }

    /// Pack the surface into the 1-bit-per-pixel layout monochrome LCDs use:
    /// pixel `p` lands in byte `p / 8`, bit `7 - (p % 8)`. Pixels at or above
    /// `threshold` luminance are lit; `invert` flips the whole image.
    pub fn to_monochrome(&self, threshold: u8, invert: bool) -> Vec<u8> {
        let total = self.width * self.height;
        let mut packed = vec![0u8; (total + 7) / 8];
        for (i, px) in self.pixels.iter().enumerate() {
            let mut lit = Self::luminance(*px) >= threshold;
            if invert {
                lit = !lit;
            }
            if lit {
                packed[i / 8] |= 1 << (7 - (i % 8));
            }
        }
        packed
    }
}

fn blend_argb(dst: u32, src: u32, alpha: f32) -> u32 {
    let mix = |shift: u32| -> u32 {
        let d = ((dst >> shift) & 0xFF) as f32;
        let s = ((src >> shift) & 0xFF) as f32;
        ((d + (s - d) * alpha) as u32).min(255) << shift
    };
    mix(24) | mix(16) | mix(8) | mix(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monochrome_packing() {
        let mut fb = Framebuffer::new(16, 1);
        fb.set_pixel(0, 0, 0xFFFF_FFFF);
        fb.set_pixel(8, 0, 0xFFFF_FFFF);

        let packed = fb.to_monochrome(128, false);
        assert_eq!(packed.len(), 2);
        // First pixel of each byte is the high bit
        assert_eq!(packed[0], 0b1000_0000);
        assert_eq!(packed[1], 0b1000_0000);
    }

    #[test]
    fn test_monochrome_invert() {
        let fb = Framebuffer::new(8, 1);
        let packed = fb.to_monochrome(128, true);
        assert_eq!(packed[0], 0xFF);
    }

    #[test]
    fn test_blend_full_alpha_copies_source() {
        let mut a = Framebuffer::new(2, 2);
        let mut b = Framebuffer::new(2, 2);
        b.clear(0xFFFF_FFFF);
        a.blend(&b, 1.0);
        assert_eq!(a.get_pixel(0, 0), 0xFFFF_FFFF);
    }

    #[test]
    fn test_fill_rect_clips_to_bounds() {
        let mut fb = Framebuffer::new(4, 4);
        fb.fill_rect(2, 2, 10, 10, 0xFFAA_BBCC);
        assert_eq!(fb.get_pixel(3, 3), 0xFFAA_BBCC);
        assert_eq!(fb.get_pixel(1, 1), 0xFF00_0000);
    }
}
