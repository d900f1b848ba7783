//! Display timings and power states

use core::fmt;

/// One display timing.
///
/// Equality compares timings only, the way two modes are considered the
/// same for modeset decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayMode {
    /// Pixel clock in kHz
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub flags: u32,
}

impl DisplayMode {
    /// A mode with CVT-like blanking for `hdisplay`x`vdisplay` at `refresh` Hz.
    pub fn new(hdisplay: u16, vdisplay: u16, refresh: u32) -> Self {
        let htotal = hdisplay + hdisplay / 4;
        let vtotal = vdisplay + vdisplay / 24 + 3;
        Self {
            clock: htotal as u32 * vtotal as u32 * refresh / 1000,
            hdisplay,
            hsync_start: hdisplay + 48,
            hsync_end: hdisplay + 80,
            htotal,
            vdisplay,
            vsync_start: vdisplay + 3,
            vsync_end: vdisplay + 8,
            vtotal,
            flags: 0,
        }
    }

    /// Refresh rate in Hz, rounded.
    pub fn vrefresh(&self) -> u32 {
        let pixels = self.htotal as u32 * self.vtotal as u32;
        if pixels == 0 {
            return 0;
        }
        (self.clock * 1000 + pixels / 2) / pixels
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.hdisplay, self.vdisplay, self.vrefresh())
    }
}

/// Legacy DPMS levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpmsMode {
    On,
    Standby,
    Suspend,
    Off,
}

/// Integer to 16.16 fixed point, the unit of plane source coordinates.
pub const fn fixed16(v: u32) -> u32 {
    v << 16
}

/// Integer part of a 16.16 fixed point value.
pub const fn fixed16_to_int(v: u32) -> u32 {
    v >> 16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_refresh() {
        let mode = DisplayMode::new(1920, 1080, 60);
        assert_eq!(mode.vrefresh(), 60);
        assert_eq!(alloc::format!("{}", mode), "1920x1080@60");
        assert_ne!(mode, DisplayMode::new(1280, 720, 60));
        assert_eq!(fixed16_to_int(fixed16(1024)), 1024);
    }
}
