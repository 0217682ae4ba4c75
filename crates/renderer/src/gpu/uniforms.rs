use bytemuck::{Pod, Zeroable};
use chrono::{Datelike, Local, Timelike};

use crate::types::{FrameSample, CHANNEL_COUNT};

const DEFAULT_SAMPLE_RATE: f32 = 44_100.0;

/// CPU mirror of the `ShaderParams` block declared by the program prelude.
///
/// std140: scalars pack after the `vec3`, every array element occupies a
/// full 16-byte slot.
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct ShadertoyUniforms {
    pub i_resolution: [f32; 3],
    pub i_time: f32,
    pub i_time_delta: f32,
    pub i_frame: i32,
    pub i_frame_rate: f32,
    pub i_sample_rate: f32,
    pub i_mouse: [f32; 4],
    pub i_date: [f32; 4],
    pub i_channel_time: [[f32; 4]; CHANNEL_COUNT],
    pub i_channel_resolution: [[f32; 4]; CHANNEL_COUNT],
}

unsafe impl Zeroable for ShadertoyUniforms {}
unsafe impl Pod for ShadertoyUniforms {}

impl ShadertoyUniforms {
    pub fn new(width: u32, height: u32) -> Self {
        let mut uniforms = Self {
            i_resolution: [width as f32, height as f32, 1.0],
            i_time: 0.0,
            i_time_delta: 0.0,
            i_frame: 0,
            i_frame_rate: 0.0,
            i_sample_rate: DEFAULT_SAMPLE_RATE,
            i_mouse: [0.0; 4],
            i_date: [0.0; 4],
            i_channel_time: [[0.0; 4]; CHANNEL_COUNT],
            i_channel_resolution: [[0.0; 4]; CHANNEL_COUNT],
        };
        uniforms.refresh_date();
        uniforms
    }

    pub fn set_channel_resolution(&mut self, index: usize, resolution: [f32; 4]) {
        if let Some(slot) = self.i_channel_resolution.get_mut(index) {
            *slot = resolution;
        }
    }

    pub fn set_mouse(&mut self, mouse: [f32; 4]) {
        self.i_mouse = mouse;
    }

    pub fn apply_sample(&mut self, sample: FrameSample) {
        self.i_time = sample.seconds;
        self.i_time_delta = sample.delta.max(0.0);
        self.i_frame = sample.frame_index.min(i32::MAX as u32) as i32;
        self.i_frame_rate = sample.frame_rate;
        for channel in &mut self.i_channel_time {
            channel[0] = sample.seconds;
        }
        self.refresh_date();
    }

    fn refresh_date(&mut self) {
        let local_now = Local::now();
        let seconds_since_midnight = local_now.num_seconds_from_midnight() as f32
            + local_now.nanosecond() as f32 / 1_000_000_000.0;
        self.i_date = [
            local_now.year() as f32,
            // iDate.y is zero-based like JavaScript's Date.getMonth().
            local_now.month0() as f32,
            local_now.day() as f32,
            seconds_since_midnight,
        ];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_std140_block() {
        assert_eq!(std::mem::size_of::<ShadertoyUniforms>(), 192);
        assert_eq!(std::mem::offset_of!(ShadertoyUniforms, i_time), 12);
        assert_eq!(std::mem::offset_of!(ShadertoyUniforms, i_frame), 20);
        assert_eq!(std::mem::offset_of!(ShadertoyUniforms, i_mouse), 32);
        assert_eq!(std::mem::offset_of!(ShadertoyUniforms, i_date), 48);
        assert_eq!(std::mem::offset_of!(ShadertoyUniforms, i_channel_time), 64);
        assert_eq!(
            std::mem::offset_of!(ShadertoyUniforms, i_channel_resolution),
            128
        );
    }

    #[test]
    fn apply_sample_updates_time_fields() {
        let mut uniforms = ShadertoyUniforms::new(320, 200);
        uniforms.apply_sample(FrameSample {
            seconds: 1.5,
            delta: 0.25,
            frame_index: 6,
            frame_rate: 4.0,
        });
        assert_eq!(uniforms.i_time, 1.5);
        assert_eq!(uniforms.i_time_delta, 0.25);
        assert_eq!(uniforms.i_frame, 6);
        assert_eq!(uniforms.i_frame_rate, 4.0);
        assert!(uniforms.i_channel_time.iter().all(|slot| slot[0] == 1.5));
        assert_eq!(uniforms.i_resolution, [320.0, 200.0, 1.0]);
        assert!(uniforms.i_date[0] >= 2024.0);
    }
}
