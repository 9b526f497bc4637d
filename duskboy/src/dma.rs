//! DMA transfers are a faster way to copy data around than looping over LD instructions.
//!
//! OAM DMA copies 160 bytes into the OAM sprite table. Doing this manually with LD commands would take at least 320
//! cycles, DMA takes only 160. We don't model the transfer byte by byte: the whole copy lands as a single event once
//! the transfer would have finished, and OAM is locked from the CPU until then.
//!
//! The CGB adds VRAM DMA, which copies 16 byte blocks from ROM/RAM into VRAM. In general purpose mode (GDMA) the whole
//! thing happens at once and the CPU is stalled. In HBlank mode (HDMA) one block is copied each time the PPU enters
//! HBlank.
//!
//! Neither engine can touch memory itself, the console owns the bus. They hand back addresses and the console does the
//! copying.

use crate::scheduler::{EventKind, Scheduler};
use serde::{Deserialize, Serialize};

/// OAM DMA takes 160 machine cycles to copy, plus one to get started.
const OAM_DMA_MCYCLES: u64 = 161;

/// GDMA and HDMA stall the CPU for this many master clock cycles per 16 byte block, regardless of speed mode.
pub const VRAM_DMA_BLOCK_DOTS: u64 = 32;

#[derive(Clone, Default, Deserialize, Serialize)]
pub struct OamDma {
    pub reg: u8, // 0xFF46 DMA register
    pub active: bool,
    source: u16,
}

impl OamDma {
    /// Write to the 0xFF46 DMA register, which starts a transfer. A transfer that's already running is restarted from
    /// the new source.
    pub fn reg_dma_write(&mut self, sched: &mut Scheduler, v: u8, double_speed: bool) {
        self.reg = v;

        // Source addresses higher or equal to 0xFE have 0x20 subtracted from them, mapping them onto WRAM.
        let page = if v >= 0xFE { v - 0x20 } else { v };
        self.source = u16::from(page) << 8;
        self.active = true;

        let mcycle = if double_speed { 2 } else { 4 };
        sched.cancel(EventKind::OamDma);
        sched.schedule(EventKind::OamDma, OAM_DMA_MCYCLES * mcycle);
        log::debug!("OAM DMA from ${:04x}", self.source);
    }

    /// OamDma handler. Returns the source address the console should copy 160 bytes from.
    pub fn on_complete(&mut self) -> u16 {
        self.active = false;
        self.source
    }
}

#[derive(Clone, Default, Deserialize, Serialize)]
pub struct VramDma {
    source: u16,      // 0xFF51/0xFF52 HDMA1/HDMA2, lower 4 bits ignored.
    dest: u16,        // 0xFF53/0xFF54 HDMA3/HDMA4, offset into VRAM, lower 4 bits ignored.
    remaining: u8,    // Blocks left to copy.
    pub hblank: bool, // An HBlank transfer is in flight.
}

/// What a write to HDMA5 asks the console to do.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VramDmaRequest {
    /// Copy this many blocks right now.
    General(u8),
    /// Copy a block every HBlank from now on.
    HBlank,
    /// The in-flight HBlank transfer was stopped.
    Cancelled,
}

impl VramDma {
    pub fn reg_hdma1_write(&mut self, v: u8) {
        self.source = (self.source & 0x00F0) | (u16::from(v) << 8);
    }

    pub fn reg_hdma2_write(&mut self, v: u8) {
        self.source = (self.source & 0xFF00) | u16::from(v & 0xF0);
    }

    pub fn reg_hdma3_write(&mut self, v: u8) {
        self.dest = (self.dest & 0x00F0) | (u16::from(v & 0x1F) << 8);
    }

    pub fn reg_hdma4_write(&mut self, v: u8) {
        self.dest = (self.dest & 0x1F00) | u16::from(v & 0xF0);
    }

    /// Read from the 0xFF55 HDMA5 register. Bit 7 is clear while an HBlank transfer is running, the lower bits are
    /// the number of blocks left minus one. A finished transfer reads 0xFF.
    pub fn reg_hdma5_read(&self) -> u8 {
        let len = self.remaining.wrapping_sub(1) & 0x7F;
        if self.hblank {
            len
        } else {
            0x80 | len
        }
    }

    /// Write to the 0xFF55 HDMA5 register.
    pub fn reg_hdma5_write(&mut self, v: u8) -> VramDmaRequest {
        if self.hblank && v & 0x80 == 0 {
            self.hblank = false;
            log::debug!("HDMA cancelled with {} blocks left", self.remaining);
            return VramDmaRequest::Cancelled;
        }

        self.remaining = (v & 0x7F) + 1;
        if v & 0x80 != 0 {
            self.hblank = true;
            log::debug!(
                "HDMA ${:04x} -> ${:04x}, {} blocks",
                self.source,
                0x8000 | self.dest,
                self.remaining
            );
            VramDmaRequest::HBlank
        } else {
            log::debug!(
                "GDMA ${:04x} -> ${:04x}, {} blocks",
                self.source,
                0x8000 | self.dest,
                self.remaining
            );
            VramDmaRequest::General(self.remaining)
        }
    }

    /// Claims the next 16 byte block. Returns the source address and the VRAM offset to copy to.
    pub fn next_block(&mut self) -> Option<(u16, u16)> {
        if self.remaining == 0 {
            self.hblank = false;
            return None;
        }

        let block = (self.source, self.dest);
        self.source = self.source.wrapping_add(0x10);
        self.dest = (self.dest + 0x10) & 0x1FF0;
        self.remaining -= 1;
        if self.remaining == 0 {
            self.hblank = false;
        }
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test OAM DMA completes after 161 machine cycles and remaps high source pages.
    #[test]
    fn test_oam_dma_timing() {
        let mut dma = OamDma::default();
        let mut sched = Scheduler::new();
        dma.reg_dma_write(&mut sched, 0xFE, false);
        assert!(dma.active);
        assert_eq!(sched.due_in(EventKind::OamDma), Some(644));
        assert_eq!(dma.on_complete(), 0xDE00);
        assert!(!dma.active);
        assert_eq!(dma.reg, 0xFE);
    }

    // Test that restarting an OAM DMA reschedules rather than double-booking.
    #[test]
    fn test_oam_dma_restart() {
        let mut dma = OamDma::default();
        let mut sched = Scheduler::new();
        dma.reg_dma_write(&mut sched, 0xC0, false);
        sched.advance(100);
        dma.reg_dma_write(&mut sched, 0xC1, true);
        assert_eq!(sched.due_in(EventKind::OamDma), Some(322));
        assert_eq!(dma.on_complete(), 0xC100);
    }

    // Test a general purpose transfer hands out every block and then reads back as finished.
    #[test]
    fn test_gdma_blocks() {
        let mut dma = VramDma::default();
        dma.reg_hdma1_write(0xC1);
        dma.reg_hdma2_write(0x2F);
        dma.reg_hdma3_write(0xFF);
        dma.reg_hdma4_write(0xE5);

        assert_eq!(dma.reg_hdma5_write(0x01), VramDmaRequest::General(2));
        assert_eq!(dma.next_block(), Some((0xC120, 0x1FE0)));
        assert_eq!(dma.next_block(), Some((0xC130, 0x1FF0)));
        assert_eq!(dma.next_block(), None);
        assert_eq!(dma.reg_hdma5_read(), 0xFF);
    }

    // Test the HBlank mode status readback, and cancelling midway.
    #[test]
    fn test_hdma_cancel() {
        let mut dma = VramDma::default();
        assert_eq!(dma.reg_hdma5_write(0x83), VramDmaRequest::HBlank);
        assert_eq!(dma.reg_hdma5_read(), 0x03);
        dma.next_block();
        assert_eq!(dma.reg_hdma5_read(), 0x02);

        assert_eq!(dma.reg_hdma5_write(0x00), VramDmaRequest::Cancelled);
        assert!(!dma.hblank);
        assert_eq!(dma.reg_hdma5_read(), 0x82);
    }

    // Test that the destination wraps inside VRAM.
    #[test]
    fn test_dest_wraps() {
        let mut dma = VramDma::default();
        dma.reg_hdma3_write(0x1F);
        dma.reg_hdma4_write(0xF0);
        dma.reg_hdma5_write(0x81);
        assert_eq!(dma.next_block(), Some((0x0000, 0x1FF0)));
        assert_eq!(dma.next_block(), Some((0x0010, 0x0000)));
        assert!(!dma.hblank);
        assert_eq!(dma.reg_hdma5_read(), 0xFF);
    }
}
