use super::TvSystem;
use crate::config::DEFAULT_SAMPLE_RATE;

const LENGTH_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, 12, 16, 24, 18, 48, 20, 96, 22,
    192, 24, 72, 26, 16, 28, 32, 30,
];

const DUTY_TABLE: [[u8; 8]; 4] = [
    [0, 1, 0, 0, 0, 0, 0, 0],
    [0, 1, 1, 0, 0, 0, 0, 0],
    [0, 1, 1, 1, 1, 0, 0, 0],
    [1, 0, 0, 1, 1, 1, 1, 1],
];

/// Frame sequencer step positions in CPU cycles since the last reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameSchedule {
    q1: u32,
    q2_h2: u32,
    q3: u32,
    irq_4step: u32,
    q4_4step: u32,
    reset_4step: u32,
    q4_5step: u32,
    reset_5step: u32,
}

const NTSC_SCHEDULE: FrameSchedule = FrameSchedule {
    q1: 7_457,
    q2_h2: 14_913,
    q3: 22_371,
    irq_4step: 29_828,
    q4_4step: 29_829,
    reset_4step: 29_830,
    q4_5step: 37_281,
    reset_5step: 37_282,
};

const PAL_SCHEDULE: FrameSchedule = FrameSchedule {
    q1: 8_313,
    q2_h2: 16_627,
    q3: 24_939,
    irq_4step: 33_252,
    q4_4step: 33_253,
    reset_4step: 33_254,
    q4_5step: 41_565,
    reset_5step: 41_566,
};

impl FrameSchedule {
    fn for_system(tv_system: TvSystem) -> Self {
        match tv_system {
            TvSystem::Ntsc => NTSC_SCHEDULE,
            TvSystem::Pal => PAL_SCHEDULE,
        }
    }
}

enum FrameEvent {
    Quarter,
    Half,
    Irq,
    HalfWithIrq,
    IrqAndReset,
    Reset,
    None,
}

pub struct Apu {
    pulse1: PulseChannel,
    pulse2: PulseChannel,

    tv_system: TvSystem,
    schedule: FrameSchedule,
    frame_counter: u32,
    frame_mode_5_step: bool,
    frame_irq_inhibit: bool,
    frame_irq_flag: bool,
    frame_counter_write_pending: bool,
    frame_counter_write_value: u8,
    frame_counter_write_delay: u8,

    cpu_cycle: u64,
    sample_rate: u32,
    sample_phase: f64,
    samples: Vec<f32>,
}

impl Default for Apu {
    fn default() -> Self {
        Self::new(TvSystem::Ntsc)
    }
}

impl Apu {
    pub fn new(tv_system: TvSystem) -> Self {
        Self {
            pulse1: PulseChannel::new(true),
            pulse2: PulseChannel::new(false),
            tv_system,
            schedule: FrameSchedule::for_system(tv_system),
            frame_counter: 0,
            frame_mode_5_step: false,
            frame_irq_inhibit: false,
            frame_irq_flag: false,
            frame_counter_write_pending: false,
            frame_counter_write_value: 0,
            frame_counter_write_delay: 0,
            cpu_cycle: 0,
            sample_rate: DEFAULT_SAMPLE_RATE,
            sample_phase: 0.0,
            samples: Vec::with_capacity(2048),
        }
    }

    pub fn reset(&mut self) {
        self.pulse1 = PulseChannel::new(true);
        self.pulse2 = PulseChannel::new(false);
        self.frame_counter = 0;
        self.frame_mode_5_step = false;
        self.frame_irq_inhibit = false;
        self.frame_irq_flag = false;
        self.frame_counter_write_pending = false;
        self.frame_counter_write_value = 0;
        self.frame_counter_write_delay = 0;
        self.cpu_cycle = 0;
        self.sample_phase = 0.0;
        self.samples.clear();
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(8_000);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn write_register(&mut self, addr: u16, value: u8) {
        match addr {
            0x4000 => self.pulse1.write_control(value),
            0x4001 => self.pulse1.write_sweep(value),
            0x4002 => self.pulse1.write_timer_low(value),
            0x4003 => self.pulse1.write_timer_high(value),

            0x4004 => self.pulse2.write_control(value),
            0x4005 => self.pulse2.write_sweep(value),
            0x4006 => self.pulse2.write_timer_low(value),
            0x4007 => self.pulse2.write_timer_high(value),

            0x4015 => self.write_status(value),
            0x4017 => self.write_frame_counter(value),
            // Triangle, noise and DMC registers are accepted and ignored.
            _ => {}
        }
    }

    pub fn read_status(&mut self) -> u8 {
        let mut status = 0u8;
        if self.pulse1.length_counter > 0 {
            status |= 0x01;
        }
        if self.pulse2.length_counter > 0 {
            status |= 0x02;
        }
        if self.frame_irq_flag {
            status |= 0x40;
        }

        self.frame_irq_flag = false;
        status
    }

    pub fn irq_pending(&self) -> bool {
        self.frame_irq_flag
    }

    pub fn tick(&mut self) {
        self.cpu_cycle = self.cpu_cycle.wrapping_add(1);

        if self.frame_counter_write_pending {
            self.frame_counter_write_delay = self.frame_counter_write_delay.saturating_sub(1);
            if self.frame_counter_write_delay == 0 {
                self.apply_frame_counter_write(self.frame_counter_write_value);
                self.frame_counter_write_pending = false;
            }
        }

        if (self.cpu_cycle & 1) == 0 {
            self.pulse1.clock_timer();
            self.pulse2.clock_timer();
        }

        self.clock_frame_counter();

        let cpu_clock_hz = self.tv_system.cpu_clock_hz();
        self.sample_phase += self.sample_rate as f64;
        while self.sample_phase >= cpu_clock_hz {
            self.sample_phase -= cpu_clock_hz;
            let sample = self.output();
            self.samples.push(sample);
        }
    }

    pub fn take_samples(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.samples)
    }

    /// Current mixed level in `[0, 1]`.
    pub fn output(&self) -> f32 {
        mix(self.pulse1.output(), self.pulse2.output())
    }

    fn write_status(&mut self, value: u8) {
        self.pulse1.set_enabled((value & 0x01) != 0);
        self.pulse2.set_enabled((value & 0x02) != 0);
    }

    fn write_frame_counter(&mut self, value: u8) {
        if (value & 0x40) != 0 {
            self.frame_irq_flag = false;
        }
        self.frame_counter_write_pending = true;
        self.frame_counter_write_value = value;
        self.frame_counter_write_delay = if (self.cpu_cycle & 1) == 0 { 3 } else { 4 };
    }

    fn apply_frame_counter_write(&mut self, value: u8) {
        self.frame_mode_5_step = (value & 0x80) != 0;
        self.frame_irq_inhibit = (value & 0x40) != 0;
        if self.frame_irq_inhibit {
            self.frame_irq_flag = false;
        }
        self.frame_counter = 0;
        if self.frame_mode_5_step {
            self.clock_quarter_frame();
            self.clock_half_frame();
        }
    }

    fn frame_event(&self) -> FrameEvent {
        let s = &self.schedule;
        let c = self.frame_counter;
        if c == s.q1 || c == s.q3 {
            FrameEvent::Quarter
        } else if c == s.q2_h2 {
            FrameEvent::Half
        } else if self.frame_mode_5_step {
            if c == s.q4_5step {
                FrameEvent::Half
            } else if c == s.reset_5step {
                FrameEvent::Reset
            } else {
                FrameEvent::None
            }
        } else if c == s.irq_4step {
            FrameEvent::Irq
        } else if c == s.q4_4step {
            FrameEvent::HalfWithIrq
        } else if c == s.reset_4step {
            FrameEvent::IrqAndReset
        } else {
            FrameEvent::None
        }
    }

    fn clock_frame_counter(&mut self) {
        self.frame_counter = self.frame_counter.wrapping_add(1);

        match self.frame_event() {
            FrameEvent::Quarter => self.clock_quarter_frame(),
            FrameEvent::Half => {
                self.clock_quarter_frame();
                self.clock_half_frame();
            }
            FrameEvent::Irq => self.raise_frame_irq(),
            FrameEvent::HalfWithIrq => {
                self.clock_quarter_frame();
                self.clock_half_frame();
                self.raise_frame_irq();
            }
            FrameEvent::IrqAndReset => {
                self.raise_frame_irq();
                self.frame_counter = 0;
            }
            FrameEvent::Reset => self.frame_counter = 0,
            FrameEvent::None => {}
        }
    }

    fn raise_frame_irq(&mut self) {
        if !self.frame_irq_inhibit {
            self.frame_irq_flag = true;
        }
    }

    fn clock_quarter_frame(&mut self) {
        self.pulse1.clock_envelope();
        self.pulse2.clock_envelope();
    }

    fn clock_half_frame(&mut self) {
        self.pulse1.clock_length_and_sweep();
        self.pulse2.clock_length_and_sweep();
    }
}

/// Nonlinear pulse mix from the two 4-bit channel levels.
pub fn mix(p1: u8, p2: u8) -> f32 {
    let pulse_sum = p1 as f32 + p2 as f32;
    if pulse_sum == 0.0 {
        return 0.0;
    }
    (95.88 / ((8128.0 / pulse_sum) + 100.0)).clamp(0.0, 1.0)
}

/// Unsigned 8-bit PCM for a mixed sample.
pub fn to_pcm8(sample: f32) -> u8 {
    (sample.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[derive(Clone, Copy)]
struct PulseChannel {
    enabled: bool,
    channel1: bool,
    duty: u8,
    duty_step: u8,

    timer_period: u16,
    timer_counter: u16,
    length_counter: u8,

    length_halt: bool,
    constant_volume: bool,
    volume: u8,
    envelope_period: u8,
    envelope_start: bool,
    envelope_divider: u8,
    envelope_decay: u8,

    sweep_enabled: bool,
    sweep_period: u8,
    sweep_negate: bool,
    sweep_shift: u8,
    sweep_reload: bool,
    sweep_divider: u8,
}

impl PulseChannel {
    fn new(channel1: bool) -> Self {
        Self {
            enabled: false,
            channel1,
            duty: 0,
            duty_step: 0,
            timer_period: 0,
            timer_counter: 0,
            length_counter: 0,
            length_halt: false,
            constant_volume: false,
            volume: 0,
            envelope_period: 0,
            envelope_start: false,
            envelope_divider: 0,
            envelope_decay: 0,
            sweep_enabled: false,
            sweep_period: 1,
            sweep_negate: false,
            sweep_shift: 0,
            sweep_reload: false,
            sweep_divider: 0,
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.length_counter = 0;
        }
    }

    fn write_control(&mut self, value: u8) {
        self.duty = (value >> 6) & 0x03;
        self.length_halt = (value & 0x20) != 0;
        self.constant_volume = (value & 0x10) != 0;
        self.volume = value & 0x0F;
        self.envelope_period = value & 0x0F;
    }

    fn write_sweep(&mut self, value: u8) {
        self.sweep_enabled = (value & 0x80) != 0;
        self.sweep_period = (value >> 4) & 0x07;
        self.sweep_negate = (value & 0x08) != 0;
        self.sweep_shift = value & 0x07;
        self.sweep_reload = true;
    }

    fn write_timer_low(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0xFF00) | value as u16;
    }

    fn write_timer_high(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x00FF) | (((value & 0x07) as u16) << 8);
        if self.enabled {
            self.length_counter = LENGTH_TABLE[(value >> 3) as usize];
        }
        self.duty_step = 0;
        self.envelope_start = true;
    }

    fn clock_timer(&mut self) {
        if self.timer_counter == 0 {
            self.timer_counter = self.timer_period;
            self.duty_step = (self.duty_step + 1) & 0x07;
        } else {
            self.timer_counter -= 1;
        }
    }

    fn clock_envelope(&mut self) {
        if self.envelope_start {
            self.envelope_start = false;
            self.envelope_decay = 15;
            self.envelope_divider = self.envelope_period;
            return;
        }

        if self.envelope_divider == 0 {
            self.envelope_divider = self.envelope_period;
            if self.envelope_decay == 0 {
                if self.length_halt {
                    self.envelope_decay = 15;
                }
            } else {
                self.envelope_decay -= 1;
            }
        } else {
            self.envelope_divider -= 1;
        }
    }

    fn clock_length_and_sweep(&mut self) {
        if !self.length_halt && self.length_counter > 0 {
            self.length_counter -= 1;
        }

        if self.sweep_divider == 0 && self.sweep_enabled && !self.sweep_mutes() {
            self.apply_sweep();
        }
        if self.sweep_divider == 0 || self.sweep_reload {
            self.sweep_divider = self.sweep_period;
            self.sweep_reload = false;
        } else {
            self.sweep_divider -= 1;
        }
    }

    fn apply_sweep(&mut self) {
        if self.sweep_shift == 0 {
            return;
        }
        self.timer_period = self.sweep_target_period();
    }

    fn sweep_mutes(&self) -> bool {
        self.timer_period < 8 || (!self.sweep_negate && self.sweep_target_period() > 0x07FF)
    }

    fn output(&self) -> u8 {
        if !self.enabled || self.length_counter == 0 || self.sweep_mutes() {
            return 0;
        }
        if DUTY_TABLE[self.duty as usize][self.duty_step as usize] == 0 {
            return 0;
        }

        if self.constant_volume {
            self.volume
        } else {
            self.envelope_decay
        }
    }

    fn sweep_target_period(&self) -> u16 {
        let change = self.timer_period >> self.sweep_shift;
        if self.sweep_negate {
            let extra = if self.channel1 { 1 } else { 0 };
            self.timer_period.saturating_sub(change + extra)
        } else {
            self.timer_period + change
        }
    }
}
