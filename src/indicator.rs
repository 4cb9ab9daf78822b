//! Status LED driven through any `smart-leds` writer

use smart_leds::{RGB8, SmartLedsWrite};

/// What the status pixel is showing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorStatus {
    /// Station join in progress
    Connecting,
    /// Waiting for the next station retry
    Retrying,
    /// Provisioning portal is up
    Provisioning,
    /// Station is up, broker is not
    BrokerDown,
    /// Broker session established
    Online,
}

const BLUE: RGB8 = RGB8 { r: 0, g: 0, b: 64 };
const AMBER: RGB8 = RGB8 { r: 64, g: 24, b: 0 };
const PURPLE: RGB8 = RGB8 { r: 48, g: 0, b: 64 };
const YELLOW: RGB8 = RGB8 { r: 64, g: 48, b: 0 };
const OFF: RGB8 = RGB8 { r: 0, g: 0, b: 0 };

// Breathing range for the online pattern
const BREATHING_MIN: u32 = 4;
const BREATHING_MAX: u32 = 48;
const BREATHING_STEP: u32 = 2;

/// Colour of the pixel for `status` at frame `counter` (one frame per main loop tick)
pub fn frame(status: IndicatorStatus, counter: u32) -> RGB8 {
    match status {
        // fast blink
        IndicatorStatus::Connecting => {
            if (counter / 2) % 2 == 0 {
                BLUE
            } else {
                OFF
            }
        }

        // slow blink
        IndicatorStatus::Retrying => {
            if (counter / 10) % 2 == 0 {
                AMBER
            } else {
                OFF
            }
        }

        // double blink every two seconds
        IndicatorStatus::Provisioning => match counter % 20 {
            0 | 1 | 4 | 5 => PURPLE,
            _ => OFF,
        },

        IndicatorStatus::BrokerDown => YELLOW,

        IndicatorStatus::Online => {
            let steps = (BREATHING_MAX - BREATHING_MIN) / BREATHING_STEP;
            let cycle = counter % (steps * 2);
            let level = if cycle < steps {
                BREATHING_MIN + cycle * BREATHING_STEP
            } else {
                BREATHING_MAX - (cycle - steps) * BREATHING_STEP
            };
            RGB8 {
                r: 0,
                g: level as u8,
                b: 0,
            }
        }
    }
}

/// Single-pixel status indicator
pub struct StatusIndicator<L> {
    led: L,
    status: IndicatorStatus,
    counter: u32,
}

impl<L> StatusIndicator<L>
where
    L: SmartLedsWrite<Color = RGB8>,
{
    pub fn new(led: L) -> Self {
        Self {
            led,
            status: IndicatorStatus::Connecting,
            counter: 0,
        }
    }

    /// Update the status; the pattern restarts only when it changes
    pub fn set_status(&mut self, status: IndicatorStatus) {
        if self.status != status {
            self.status = status;
            self.counter = 0;
        }
    }

    pub fn status(&self) -> IndicatorStatus {
        self.status
    }

    /// Render the next frame
    pub fn update(&mut self) {
        let colour = frame(self.status, self.counter);
        self.counter = self.counter.wrapping_add(1);
        // LED errors are cosmetic
        let _ = self.led.write([colour].into_iter());
    }

    pub fn led(&self) -> &L {
        &self.led
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingLed {
        frames: alloc::vec::Vec<RGB8>,
    }

    impl SmartLedsWrite for RecordingLed {
        type Error = ();
        type Color = RGB8;

        fn write<T, I>(&mut self, iterator: T) -> Result<(), ()>
        where
            T: IntoIterator<Item = I>,
            I: Into<RGB8>,
        {
            self.frames.extend(iterator.into_iter().map(Into::into));
            Ok(())
        }
    }

    #[test]
    fn each_status_has_a_distinct_pattern() {
        let patterns: alloc::vec::Vec<alloc::vec::Vec<RGB8>> = [
            IndicatorStatus::Connecting,
            IndicatorStatus::Retrying,
            IndicatorStatus::Provisioning,
            IndicatorStatus::BrokerDown,
            IndicatorStatus::Online,
        ]
        .iter()
        .map(|status| (0..40).map(|counter| frame(*status, counter)).collect())
        .collect();

        for (i, a) in patterns.iter().enumerate() {
            for b in patterns.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn provisioning_blinks_twice() {
        let lit = (0..20)
            .filter(|counter| frame(IndicatorStatus::Provisioning, *counter) != OFF)
            .count();
        assert_eq!(lit, 4);
    }

    #[test]
    fn status_change_restarts_pattern() {
        let mut indicator = StatusIndicator::new(RecordingLed {
            frames: alloc::vec::Vec::new(),
        });
        indicator.update();
        indicator.update();
        indicator.set_status(IndicatorStatus::Retrying);
        indicator.update();

        assert_eq!(indicator.led().frames, [BLUE, BLUE, AMBER]);
    }
}
