//! Draws an entire line of graphical data in one go, once the PPU reaches HBlank.
//!
//! Each pixel gets a colour index (0-3) and palette from the background or window, then sprites are laid over the top.
//! The same path handles DMG and CGB games. In DMG mode the BGP/OBPx registers pick a shade, which is looked up in the
//! first BG/OBJ palettes of palette RAM. That's where the DMG shades (or the CGB colorization palettes) live.

use super::{LineSprite, Ppu, OBJ_PALETTES, SCREEN_WIDTH};
use crate::util::expand_5bit;

/// CGB BG map attribute bits.
const ATTR_PRIORITY: u8 = 0x80;
const ATTR_VFLIP: u8 = 0x40;
const ATTR_HFLIP: u8 = 0x20;
const ATTR_BANK: u8 = 0x08;

#[derive(Clone, Copy, Default)]
struct BgPixel {
    color: u8,     // Raw 2 bit colour index, before palettes.
    palette: u8,
    priority: bool, // CGB BG-over-OBJ attribute.
}

impl LineSprite {
    fn behind_bg(self) -> bool {
        self.attrs & 0x80 != 0
    }
    fn vflip(self) -> bool {
        self.attrs & 0x40 != 0
    }
    fn hflip(self) -> bool {
        self.attrs & 0x20 != 0
    }
}

/// Reads one row of a tile as 8 colour indexes, leftmost first.
fn tile_row(ppu: &Ppu, bank: usize, addr: usize, hflip: bool) -> [u8; 8] {
    let base = (bank << 13) + addr;
    let lo = ppu.vram[base];
    let hi = ppu.vram[base + 1];
    let mut row = [0; 8];
    for (i, px) in row.iter_mut().enumerate() {
        let bit = if hflip { i } else { 7 - i };
        *px = ((hi >> bit) & 1) << 1 | ((lo >> bit) & 1);
    }
    row
}

/// Where a BG/window tile's data lives, relative to 0x8000.
fn bg_tile_addr(ppu: &Ppu, code: u8) -> usize {
    if ppu.bg_tiles_lo {
        usize::from(code) * 16
    } else {
        (0x1000 + i32::from(code as i8) * 16) as usize
    }
}

/// Fetches a pixel row from a tile map. `map` is the map base relative to 0x8000, `x`/`y` are map coordinates.
fn map_row(ppu: &Ppu, map: usize, tx: usize, y: usize) -> ([u8; 8], u8) {
    let entry = map + (y / 8 % 32) * 32 + tx % 32;
    let code = ppu.vram[entry];
    let attrs = if ppu.cgb { ppu.vram[0x2000 + entry] } else { 0 };

    let mut row_y = y % 8;
    if attrs & ATTR_VFLIP != 0 {
        row_y = 7 - row_y;
    }
    let bank = if attrs & ATTR_BANK != 0 { 1 } else { 0 };
    let row = tile_row(ppu, bank, bg_tile_addr(ppu, code) + row_y * 2, attrs & ATTR_HFLIP != 0);
    (row, attrs)
}

fn bg_pixel(color: u8, attrs: u8) -> BgPixel {
    BgPixel {
        color,
        palette: attrs & 0x07,
        priority: attrs & ATTR_PRIORITY != 0,
    }
}

fn map_base(hi: bool) -> usize {
    if hi {
        0x1C00
    } else {
        0x1800
    }
}

fn draw_background(ppu: &Ppu, line: &mut [BgPixel; SCREEN_WIDTH]) {
    let map = map_base(ppu.bg_map_hi);
    let y = usize::from(ppu.ly.wrapping_add(ppu.scy));
    let mut x = 0;
    let mut map_x = usize::from(ppu.scx);
    while x < SCREEN_WIDTH {
        let (row, attrs) = map_row(ppu, map, map_x / 8, y);
        let mut fine = map_x % 8;
        while fine < 8 && x < SCREEN_WIDTH {
            line[x] = bg_pixel(row[fine], attrs);
            fine += 1;
            x += 1;
            map_x += 1;
        }
    }
}

/// Draws the window over the background. Returns whether any of it was visible on this line.
fn draw_window(ppu: &Ppu, line: &mut [BgPixel; SCREEN_WIDTH]) -> bool {
    if !ppu.win_enabled || ppu.ly < ppu.wy || ppu.wx > 166 {
        return false;
    }

    let map = map_base(ppu.win_map_hi);
    let y = usize::from(ppu.window_line);
    let start = usize::from(ppu.wx).saturating_sub(7);
    let skip = 7usize.saturating_sub(usize::from(ppu.wx));
    for x in start..SCREEN_WIDTH {
        let wx = x - start + skip;
        let (row, attrs) = map_row(ppu, map, wx / 8, y);
        line[x] = bg_pixel(row[wx % 8], attrs);
    }
    true
}

/// Picks the sprites on this line in drawing priority order, highest first.
fn sorted_sprites(ppu: &Ppu) -> Vec<LineSprite> {
    let mut sprites = ppu.line_sprites[..usize::from(ppu.line_sprite_count)].to_vec();

    // On the CGB only OAM order matters. On the DMG the leftmost sprite wins, with OAM order breaking ties.
    if !ppu.cgb {
        sprites.sort_by_key(|s| (s.x, s.index));
    }
    sprites
}

/// Combines one finished pixel into the framebuffer.
fn put_pixel(ppu: &mut Ppu, x: usize, rgb555: u16) {
    let offset = (usize::from(ppu.ly) * SCREEN_WIDTH + x) * 4;
    let px = &mut ppu.framebuffer[offset..offset + 4];
    px[0] = expand_5bit(rgb555);
    px[1] = expand_5bit(rgb555 >> 5);
    px[2] = expand_5bit(rgb555 >> 10);
    px[3] = 0xFF;
}

fn dmg_shade(palette: u8, color: u8) -> usize {
    usize::from((palette >> (color * 2)) & 0b11)
}

#[allow(clippy::needless_range_loop)]
pub(super) fn draw_line(ppu: &mut Ppu) {
    let mut line = [BgPixel::default(); SCREEN_WIDTH];

    // On the DMG LCDC bit 0 blanks the BG and window. On the CGB it instead takes away their priority over sprites.
    let bg_visible = ppu.cgb || ppu.bg_enabled;
    if bg_visible {
        draw_background(ppu, &mut line);
        if draw_window(ppu, &mut line) {
            ppu.window_line = ppu.window_line.wrapping_add(1);
        }
    }

    // Sprite pixels, claimed by the highest priority sprite with an opaque pixel there.
    let mut sprite_line: [Option<(u8, LineSprite)>; SCREEN_WIDTH] = [None; SCREEN_WIDTH];
    if ppu.obj_enabled {
        let height = ppu.line_sprite_height;
        for sprite in sorted_sprites(ppu) {
            // Sprites coming from a restored state aren't guaranteed to cover this line.
            let mut row_y = match (usize::from(ppu.ly) + 16).checked_sub(usize::from(sprite.y)) {
                Some(row_y) if row_y < usize::from(height) => row_y,
                _ => continue,
            };
            if sprite.vflip() {
                row_y = usize::from(height) - 1 - row_y;
            }
            let tile = if height == 16 { sprite.tile & 0xFE } else { sprite.tile };
            let bank = if ppu.cgb && sprite.attrs & ATTR_BANK != 0 { 1 } else { 0 };
            let row = tile_row(ppu, bank, usize::from(tile) * 16 + row_y * 2, sprite.hflip());

            for (i, &color) in row.iter().enumerate() {
                let x = usize::from(sprite.x) + i;
                if x < 8 || x - 8 >= SCREEN_WIDTH || color == 0 {
                    continue;
                }
                let slot = &mut sprite_line[x - 8];
                if slot.is_none() {
                    *slot = Some((color, sprite));
                }
            }
        }
    }

    let master_priority = ppu.cgb && !ppu.bg_enabled;
    for x in 0..SCREEN_WIDTH {
        let bg = line[x];
        let sprite_wins = match sprite_line[x] {
            None => false,
            Some(_) if master_priority || bg.color == 0 => true,
            Some((_, sprite)) => !(sprite.behind_bg() || (ppu.cgb && bg.priority)),
        };

        let rgb = match sprite_line[x] {
            Some((color, sprite)) if sprite_wins => {
                if ppu.cgb {
                    ppu.palettes[OBJ_PALETTES + usize::from(sprite.attrs & 0x07) * 4 + usize::from(color)]
                } else {
                    let (reg, pal) = if sprite.attrs & 0x10 != 0 { (ppu.obp1, 1) } else { (ppu.obp0, 0) };
                    ppu.palettes[OBJ_PALETTES + pal * 4 + dmg_shade(reg, color)]
                }
            }
            _ => {
                if ppu.cgb {
                    ppu.palettes[usize::from(bg.palette) * 4 + usize::from(bg.color)]
                } else {
                    ppu.palettes[dmg_shade(ppu.bgp, bg.color)]
                }
            }
        };
        put_pixel(ppu, x, rgb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Model;

    fn pixel(ppu: &Ppu, x: usize, y: usize) -> [u8; 4] {
        let offset = (y * SCREEN_WIDTH + x) * 4;
        let mut px = [0; 4];
        px.copy_from_slice(&ppu.framebuffer[offset..offset + 4]);
        px
    }

    const WHITE: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
    const BLACK: [u8; 4] = [0x00, 0x00, 0x00, 0xFF];

    fn dmg_ppu() -> Ppu {
        let mut ppu = Ppu::new(Model::Dmg);
        ppu.bg_enabled = true;
        ppu.bg_tiles_lo = true;
        ppu.bgp = 0xE4;
        ppu.obp0 = 0xE4;
        // Tile 1 is solid colour 3, tile 2 solid colour 1.
        for i in 0..16 {
            ppu.vram[16 + i] = 0xFF;
            ppu.vram[32 + i] = if i % 2 == 0 { 0xFF } else { 0x00 };
        }
        ppu
    }

    // Test the BG map is scrolled by SCX/SCY, with fine scrolling inside a tile.
    #[test]
    fn test_background_scroll() {
        let mut ppu = dmg_ppu();
        ppu.vram[0x1800 + 1] = 1; // Map (1, 0) is black.
        ppu.scx = 4;
        draw_line(&mut ppu);
        assert_eq!(pixel(&ppu, 3, 0), WHITE);
        assert_eq!(pixel(&ppu, 4, 0), BLACK);
        assert_eq!(pixel(&ppu, 11, 0), BLACK);
        assert_eq!(pixel(&ppu, 12, 0), WHITE);
    }

    // Test that the window starts at WX-7 and only bumps its line counter when drawn.
    #[test]
    fn test_window() {
        let mut ppu = dmg_ppu();
        ppu.win_enabled = true;
        ppu.win_map_hi = true;
        for i in 0..32 {
            ppu.vram[0x1C00 + i] = 1;
        }
        ppu.wx = 87;
        ppu.wy = 0;
        draw_line(&mut ppu);
        assert_eq!(pixel(&ppu, 79, 0), WHITE);
        assert_eq!(pixel(&ppu, 80, 0), BLACK);
        assert_eq!(ppu.window_line, 1);

        ppu.wy = 10;
        ppu.ly = 1;
        draw_line(&mut ppu);
        assert_eq!(pixel(&ppu, 80, 1), WHITE);
        assert_eq!(ppu.window_line, 1);
    }

    // Test DMG sprite priority: lower X wins even with a higher OAM index, and BG colour 1-3 hides "behind" sprites.
    #[test]
    fn test_dmg_sprite_priority() {
        let mut ppu = dmg_ppu();
        ppu.obj_enabled = true;
        ppu.obp0 = 0x1B; // Reverse: colour 3 -> white, colour 1 -> dark grey.
        ppu.oam[0..4].copy_from_slice(&[16, 12, 2, 0x00]);
        ppu.oam[4..8].copy_from_slice(&[16, 10, 1, 0x00]);
        ppu.oam[8..12].copy_from_slice(&[16, 40, 1, 0x80]);
        ppu.scan_oam();
        ppu.vram[0x1800 + 4] = 2; // BG colour 1 under the third sprite.

        draw_line(&mut ppu);
        // Sprite 1 (x=10) beats sprite 0 (x=12) where they overlap.
        assert_eq!(pixel(&ppu, 4, 0), WHITE);
        assert_eq!(pixel(&ppu, 9, 0), WHITE);
        // Only sprite 0 covers x=10, colour 1 through the reversed palette.
        assert_eq!(pixel(&ppu, 10, 0), [0x52, 0x52, 0x52, 0xFF]);
        // Behind BG: BG colour 1 shows (light grey), not the sprite.
        assert_eq!(pixel(&ppu, 32, 0), [0xAD, 0xAD, 0xAD, 0xFF]);
    }

    // Test that LCDC bit 0 blanks the BG on DMG, but on CGB only gives sprites master priority.
    #[test]
    fn test_lcdc_bit0() {
        let mut ppu = dmg_ppu();
        ppu.vram[0x1800] = 1;
        ppu.bg_enabled = false;
        draw_line(&mut ppu);
        assert_eq!(pixel(&ppu, 0, 0), WHITE);

        let mut ppu = Ppu::new(Model::Cgb);
        ppu.cgb = true;
        ppu.bg_tiles_lo = true;
        ppu.obj_enabled = true;
        for i in 0..16 {
            ppu.vram[16 + i] = 0xFF;
        }
        ppu.vram[0x1800] = 1;
        ppu.vram[0x3800] = ATTR_PRIORITY | 1; // BG palette 1, priority over sprites.
        ppu.palettes[4 + 3] = 0x001F; // BG palette 1 colour 3: red.
        ppu.palettes[OBJ_PALETTES + 3] = 0x7C00; // OBJ palette 0 colour 3: blue.
        ppu.oam[0..4].copy_from_slice(&[16, 8, 1, 0x00]);
        ppu.scan_oam();

        ppu.bg_enabled = true;
        draw_line(&mut ppu);
        assert_eq!(pixel(&ppu, 0, 0), [0xFF, 0x00, 0x00, 0xFF]);

        ppu.bg_enabled = false;
        draw_line(&mut ppu);
        assert_eq!(pixel(&ppu, 0, 0), [0x00, 0x00, 0xFF, 0xFF]);
    }

    // Test CGB BG attributes: tile bank and horizontal flip.
    #[test]
    fn test_cgb_attributes() {
        let mut ppu = Ppu::new(Model::Cgb);
        ppu.cgb = true;
        ppu.bg_enabled = true;
        ppu.bg_tiles_lo = true;
        ppu.whiten_palettes();
        ppu.palettes[3] = 0;
        // Bank 1 tile 0: leftmost pixel only.
        for i in 0..8 {
            ppu.vram[0x2000 + i * 2] = 0x80;
            ppu.vram[0x2000 + i * 2 + 1] = 0x80;
        }
        ppu.vram[0x3800] = ATTR_BANK;
        draw_line(&mut ppu);
        assert_eq!(pixel(&ppu, 0, 0), BLACK);
        assert_eq!(pixel(&ppu, 7, 0), WHITE);

        ppu.vram[0x3800] = ATTR_BANK | ATTR_HFLIP;
        draw_line(&mut ppu);
        assert_eq!(pixel(&ppu, 0, 0), WHITE);
        assert_eq!(pixel(&ppu, 7, 0), BLACK);
    }
}
