use std::collections::VecDeque;

use serde::Serialize;

use crate::config::{AdaptiveConfig, RateControl};

const HISTORY_LEN: usize = 20;

/// Latency report from the sink, consumed once.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FeedbackSample {
    pub avg_latency_us: i64,
    pub max_latency_us: i64,
    pub stalled: bool,
}

/// Values that changed on one feedback sample and must be pushed downstream.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Adaptation {
    pub video_bitrate: Option<u32>,
    pub frame_rate: Option<f64>,
}

impl Adaptation {
    pub fn is_empty(&self) -> bool {
        self.video_bitrate.is_none() && self.frame_rate.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdaptationRecord {
    pub avg_latency_us: i64,
    pub previous_bitrate: u32,
    pub previous_frame_rate: Option<f64>,
    pub applied: Adaptation,
}

/// Closed-loop bitrate and frame-rate controller driven by sink latency.
#[derive(Debug)]
pub struct AdaptiveController {
    config: AdaptiveConfig,
    // last value pushed to the encoder
    video_bitrate: u32,
    // last value pushed to the repeater, None without one
    frame_rate: Option<f64>,
    history: VecDeque<AdaptationRecord>,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConfig, video_bitrate: u32, frame_rate: Option<f64>) -> Self {
        Self {
            config,
            video_bitrate,
            frame_rate,
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    pub fn video_bitrate(&self) -> u32 {
        self.video_bitrate
    }

    pub fn frame_rate(&self) -> Option<f64> {
        self.frame_rate
    }

    pub fn set_frame_rate(&mut self, frame_rate: Option<f64>) {
        self.frame_rate = frame_rate;
    }

    pub fn history(&self) -> impl Iterator<Item = &AdaptationRecord> {
        self.history.iter()
    }

    /// Bitrate to apply for `avg_latency_us`, or None if nothing changes.
    pub fn next_bitrate(&self, current: u32, avg_latency_us: i64) -> Option<u32> {
        let target = match self.config.video_bitrate {
            RateControl::Off => return None,
            RateControl::Fixed(bitrate) => bitrate as f64,
            RateControl::Adaptive => {
                let mut bitrate = current as f64;
                if avg_latency_us > self.config.high_latency_us {
                    bitrate *= self.config.bitrate_decrease;
                } else if avg_latency_us < self.config.low_latency_bitrate_us {
                    bitrate *= self.config.bitrate_increase;
                }
                bitrate
            }
        };

        if !(target > 0.0) {
            return None;
        }

        let clamped = (target.round() as u64)
            .clamp(self.config.min_bitrate as u64, self.config.max_bitrate as u64)
            as u32;
        (clamped != current).then_some(clamped)
    }

    /// Frame rate to apply for `avg_latency_us`, or None if nothing changes.
    pub fn next_frame_rate(&self, current: f64, avg_latency_us: i64) -> Option<f64> {
        let target = match self.config.video_frame_rate {
            RateControl::Off => return None,
            RateControl::Fixed(rate) => rate,
            RateControl::Adaptive => {
                let mut rate = current;
                if avg_latency_us > self.config.high_latency_us {
                    rate *= self.config.frame_rate_decrease;
                } else if avg_latency_us < self.config.low_latency_frame_rate_us {
                    rate *= self.config.frame_rate_increase;
                }
                rate
            }
        };

        if !(target > 0.0) {
            return None;
        }

        let clamped = target.clamp(self.config.min_frame_rate, self.config.max_frame_rate);
        (clamped != current).then_some(clamped)
    }

    /// Updates the controller from one sample. Stall reports never move the
    /// targets; the caller drops a frame instead.
    pub fn on_feedback(&mut self, sample: &FeedbackSample) -> Adaptation {
        if sample.stalled {
            return Adaptation::default();
        }

        let adaptation = Adaptation {
            video_bitrate: self.next_bitrate(self.video_bitrate, sample.avg_latency_us),
            frame_rate: self
                .frame_rate
                .and_then(|rate| self.next_frame_rate(rate, sample.avg_latency_us)),
        };

        if adaptation.is_empty() {
            return adaptation;
        }

        self.history.push_back(AdaptationRecord {
            avg_latency_us: sample.avg_latency_us,
            previous_bitrate: self.video_bitrate,
            previous_frame_rate: self.frame_rate,
            applied: adaptation,
        });
        if self.history.len() > HISTORY_LEN {
            self.history.pop_front();
        }

        if let Some(bitrate) = adaptation.video_bitrate {
            self.video_bitrate = bitrate;
        }
        if let Some(rate) = adaptation.frame_rate {
            self.frame_rate = Some(rate);
        }
        adaptation
    }
}
