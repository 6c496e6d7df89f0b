//! Energy-based voice activity detection
//!
//! The shared detector classifies frames by RMS energy against an adaptive
//! threshold: quiet frames feed a running noise floor, and a frame counts as
//! voice when it clears the floor by a configured margin (never below the
//! absolute minimum threshold). The floor lives behind a mutex so one
//! instance can serve every connection. Utterance boundaries come from
//! `VadWindow`, a short sliding history owned by each connection's pipeline.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::config::Config;
use crate::providers::Vad;

/// Minimum RMS threshold on i16 samples; tuned for close-mic embedded devices.
pub const DEFAULT_ENERGY_THRESHOLD: f32 = 200.0;

/// Voice must clear the noise floor by this factor.
pub const DEFAULT_NOISE_MARGIN: f32 = 3.0;

/// Exponential smoothing rate for the noise floor (0.0-1.0).
pub const DEFAULT_ADAPTATION_RATE: f32 = 0.05;

/// Sliding-window length in frames used for end-of-speech decisions.
pub const VOICE_WINDOW_FRAMES: usize = 5;

pub struct EnergyVad {
    /// Absolute floor for the decision threshold.
    threshold: f32,
    /// Multiple of the noise floor that counts as voice.
    margin: f32,
    adaptive: bool,
    adaptation_rate: f32,
    /// Running noise estimate, fed by non-voice frames. Starts very low so
    /// the fixed threshold governs until the environment is learned.
    noise_floor: Mutex<f32>,
}

impl EnergyVad {
    pub fn new(threshold: f32) -> Self {
        Self::with_options(
            threshold,
            DEFAULT_NOISE_MARGIN,
            true,
            DEFAULT_ADAPTATION_RATE,
        )
    }

    pub fn with_options(threshold: f32, margin: f32, adaptive: bool, adaptation_rate: f32) -> Self {
        Self {
            threshold,
            margin,
            adaptive,
            adaptation_rate,
            noise_floor: Mutex::new(1.0),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let extra = config.provider(&config.selected_module.vad).extra;
        let get = |key: &str, default: f32| {
            extra
                .get(key)
                .and_then(|v| v.as_f64())
                .map(|v| v as f32)
                .unwrap_or(default)
        };
        let adaptive = extra
            .get("adaptive_noise_floor")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        Self::with_options(
            get("threshold", DEFAULT_ENERGY_THRESHOLD),
            get("margin", DEFAULT_NOISE_MARGIN),
            adaptive,
            get("adaptation_rate", DEFAULT_ADAPTATION_RATE),
        )
    }

    /// Current noise estimate, mainly for diagnostics.
    pub fn noise_floor(&self) -> f32 {
        *self.noise_floor.lock().unwrap()
    }
}

impl Vad for EnergyVad {
    fn is_voice(&self, frame: &[i16]) -> bool {
        let rms = rms_energy(frame);
        let mut floor = self.noise_floor.lock().unwrap();
        let threshold = (*floor * self.margin).max(self.threshold);
        let voiced = rms > threshold;

        // Only non-voice frames update the floor, so speech never teaches
        // the detector to ignore speech.
        if self.adaptive && !voiced {
            *floor = *floor * (1.0 - self.adaptation_rate) + rms * self.adaptation_rate;
        }
        voiced
    }
}

/// Compute RMS energy of audio samples.
pub fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&s| (s as f32).powi(2)).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Per-connection sliding history of frame verdicts. Voice is considered
/// started after two voiced frames in the window; stopped once the window is
/// full of silence after voice was seen.
#[derive(Debug)]
pub struct VadWindow {
    history: VecDeque<bool>,
    capacity: usize,
    have_voice: bool,
}

impl Default for VadWindow {
    fn default() -> Self {
        Self::new(VOICE_WINDOW_FRAMES)
    }
}

impl VadWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            have_voice: false,
        }
    }

    /// Record one frame verdict and update the latched voice flag.
    pub fn push(&mut self, voiced: bool) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(voiced);

        if !self.have_voice && self.history.iter().filter(|&&v| v).count() >= 2 {
            self.have_voice = true;
        }
    }

    /// Voice has been seen in this utterance.
    pub fn have_voice(&self) -> bool {
        self.have_voice
    }

    /// End-of-speech: voice was seen, the window is full, and every recent
    /// frame is silence.
    pub fn voice_stopped(&self) -> bool {
        self.have_voice
            && self.history.len() == self.capacity
            && self.history.iter().all(|&v| !v)
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.have_voice = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_energy() {
        assert_eq!(rms_energy(&[]), 0.0);
        assert!(rms_energy(&[1000, -1000, 1000, -1000]) > 900.0);
        assert!(rms_energy(&[0, 0, 0, 0]) < 1.0);
    }

    #[test]
    fn test_energy_vad_verdicts() {
        let vad = EnergyVad::new(200.0);
        assert!(vad.is_voice(&[1000i16; 160]));
        assert!(!vad.is_voice(&[10i16; 160]));
    }

    #[test]
    fn test_noise_floor_adapts_to_steady_hum() {
        let vad = EnergyVad::new(200.0);
        // A steady 150-RMS hum sits under the fixed threshold and teaches
        // the floor; afterwards the effective threshold is floor * margin.
        let hum = vec![150i16; 160];
        for _ in 0..200 {
            assert!(!vad.is_voice(&hum));
        }
        assert!(vad.noise_floor() > 100.0);

        // 300 RMS would clear a fixed 200 threshold, but not 3x the hum.
        assert!(!vad.is_voice(&[300i16; 160]));
        // Real speech still clears it comfortably.
        assert!(vad.is_voice(&[2000i16; 160]));
    }

    #[test]
    fn test_voice_frames_do_not_raise_floor() {
        let vad = EnergyVad::new(200.0);
        let before = vad.noise_floor();
        for _ in 0..50 {
            assert!(vad.is_voice(&[3000i16; 160]));
        }
        assert_eq!(vad.noise_floor(), before);
    }

    #[test]
    fn test_adaptation_can_be_disabled() {
        let vad = EnergyVad::with_options(200.0, DEFAULT_NOISE_MARGIN, false, 0.5);
        let hum = vec![150i16; 160];
        for _ in 0..100 {
            assert!(!vad.is_voice(&hum));
        }
        assert_eq!(vad.noise_floor(), 1.0);
        // Threshold stays fixed, so 300 RMS is still voice.
        assert!(vad.is_voice(&[300i16; 160]));
    }

    #[test]
    fn test_window_latches_voice_after_two_frames() {
        let mut window = VadWindow::default();
        window.push(true);
        assert!(!window.have_voice());
        window.push(true);
        assert!(window.have_voice());
    }

    #[test]
    fn test_window_detects_end_of_speech() {
        let mut window = VadWindow::default();
        for _ in 0..3 {
            window.push(true);
        }
        assert!(window.have_voice());
        assert!(!window.voice_stopped());
        for _ in 0..VOICE_WINDOW_FRAMES {
            window.push(false);
        }
        assert!(window.voice_stopped());
    }

    #[test]
    fn test_no_end_of_speech_without_voice() {
        let mut window = VadWindow::default();
        for _ in 0..VOICE_WINDOW_FRAMES * 2 {
            window.push(false);
        }
        assert!(!window.voice_stopped());
    }

    #[test]
    fn test_reset() {
        let mut window = VadWindow::default();
        window.push(true);
        window.push(true);
        window.reset();
        assert!(!window.have_voice());
    }
}
