pub const BUTTON_A: u8 = 0x01;
pub const BUTTON_B: u8 = 0x02;
pub const BUTTON_SELECT: u8 = 0x04;
pub const BUTTON_START: u8 = 0x08;
pub const BUTTON_UP: u8 = 0x10;
pub const BUTTON_DOWN: u8 = 0x20;
pub const BUTTON_LEFT: u8 = 0x40;
pub const BUTTON_RIGHT: u8 = 0x80;

/// Standard joypad: an 8-bit parallel-in shift register behind `$4016/$4017`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Controller {
    state: u8,
    shift: u8,
    strobe: bool,
}

impl Controller {
    /// A pad cannot report both directions of an axis; such pairs are dropped.
    pub fn set_state(&mut self, state: u8) {
        let mut state = state;
        if state & (BUTTON_UP | BUTTON_DOWN) == BUTTON_UP | BUTTON_DOWN {
            state &= !(BUTTON_UP | BUTTON_DOWN);
        }
        if state & (BUTTON_LEFT | BUTTON_RIGHT) == BUTTON_LEFT | BUTTON_RIGHT {
            state &= !(BUTTON_LEFT | BUTTON_RIGHT);
        }
        self.state = state;
        if self.strobe {
            self.shift = self.state;
        }
    }

    pub fn state(&self) -> u8 {
        self.state
    }

    pub fn write_strobe(&mut self, value: u8) {
        self.strobe = (value & 0x01) != 0;
        if self.strobe {
            self.shift = self.state;
        }
    }

    /// Returns the next button bit; after eight reads the register yields 1s.
    pub fn read(&mut self) -> u8 {
        let bit = if self.strobe {
            self.state & 0x01
        } else {
            let out = self.shift & 0x01;
            self.shift = (self.shift >> 1) | 0x80;
            out
        };
        0x40 | bit
    }
}
