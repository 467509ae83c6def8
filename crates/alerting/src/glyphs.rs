//! 5x7 bitmap font for overlay labels.
//!
//! Upper-case letters, digits and a little punctuation. Lower case is drawn
//! as upper case; anything else as `?`.

use image::{Rgb, RgbImage};

pub const GLYPH_WIDTH: u32 = 5;
pub const GLYPH_HEIGHT: u32 = 7;
/// Blank columns between glyphs
const SPACING: u32 = 1;

/// Rows top to bottom; bit 4 is the leftmost column
fn glyph(c: char) -> [u8; 7] {
    match c.to_ascii_uppercase() {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        ' ' => [0x00; 7],
        '%' => [0x18, 0x19, 0x02, 0x04, 0x08, 0x13, 0x03],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '/' => [0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x00],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        _ => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x00, 0x04],
    }
}

/// Width in pixels of `text` drawn at `scale`
pub fn text_width(text: &str, scale: u32) -> u32 {
    let count = text.chars().count() as u32;
    (count * (GLYPH_WIDTH + SPACING)).saturating_sub(SPACING) * scale
}

/// Draw `text` with its top-left corner at (`x`, `y`).
///
/// Glyphs that would cross `max_width` are dropped whole; pixels outside
/// the image are clipped. Returns the drawn width.
pub fn draw_text(
    image: &mut RgbImage,
    x: u32,
    y: u32,
    text: &str,
    scale: u32,
    max_width: u32,
    color: Rgb<u8>,
) -> u32 {
    let scale = scale.max(1);
    let advance = (GLYPH_WIDTH + SPACING) * scale;
    let mut drawn = 0;
    for (i, c) in text.chars().enumerate() {
        let left = i as u32 * advance;
        if left + GLYPH_WIDTH * scale > max_width {
            break;
        }
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (0x10 >> col) != 0 {
                    let px = x + left + col * scale;
                    let py = y + row as u32 * scale;
                    fill_block(image, px, py, scale, color);
                }
            }
        }
        drawn = left + GLYPH_WIDTH * scale;
    }
    drawn
}

fn fill_block(image: &mut RgbImage, x: u32, y: u32, size: u32, color: Rgb<u8>) {
    let (width, height) = image.dimensions();
    for py in y..y.saturating_add(size).min(height) {
        for px in x..x.saturating_add(size).min(width) {
            image.put_pixel(px, py, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

    #[test]
    fn test_lower_case_draws_as_upper_case() {
        assert_eq!(glyph('a'), glyph('A'));
        assert_eq!(glyph('~'), glyph('?'));
        assert_ne!(glyph('O'), glyph('0'));
    }

    #[test]
    fn test_draw_text_scales_glyphs() {
        let mut image = RgbImage::new(40, 20);
        let drawn = draw_text(&mut image, 0, 0, "-", 2, 40, WHITE);
        assert_eq!(drawn, 10);
        // Middle row of '-' at 2x covers rows 6..8
        assert_eq!(*image.get_pixel(0, 6), WHITE);
        assert_eq!(*image.get_pixel(9, 7), WHITE);
        assert_eq!(*image.get_pixel(0, 5), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(10, 6), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_text_is_cut_at_max_width() {
        let mut image = RgbImage::new(100, 10);
        assert_eq!(text_width("ABC", 1), 17);
        assert_eq!(draw_text(&mut image, 0, 0, "ABC", 1, 12, WHITE), 11);
        assert!((12..100).all(|x| (0..7).all(|y| *image.get_pixel(x, y) == Rgb([0, 0, 0]))));
    }

    #[test]
    fn test_drawing_past_the_edge_is_clipped() {
        let mut image = RgbImage::new(4, 4);
        draw_text(&mut image, 2, 2, "W", 3, 100, WHITE);
        assert_eq!(*image.get_pixel(3, 3), WHITE);
    }
}
