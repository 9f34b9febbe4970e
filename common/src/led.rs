//! RGB status indication for the single on-board NeoPixel.
//!
//! The pixel is driven through [`PixelDriver`]; on ESP32 that is an RMT
//! channel, on the host it only records the colour.

use std::collections::HashMap;

use serde::Serialize;

use crate::params::to_int;

pub const DEFAULT_BRIGHTNESS: u8 = 128;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const OFF: Self = Self::new(0, 0, 0);
    pub const RED: Self = Self::new(255, 0, 0);
    pub const GREEN: Self = Self::new(0, 255, 0);
    pub const BLUE: Self = Self::new(0, 0, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Applies a global brightness the way the NeoPixel library does it:
    /// `(c * (brightness + 1)) >> 8`, with 0 meaning fully off.
    pub fn scaled(self, brightness: u8) -> Self {
        if brightness == 0 {
            return Self::OFF;
        }
        let scale = |c: u8| ((u16::from(c) * (u16::from(brightness) + 1)) >> 8) as u8;
        Self::new(scale(self.r), scale(self.g), scale(self.b))
    }

    /// GRB byte order as clocked out to a WS2812.
    pub fn grb(self) -> [u8; 3] {
        [self.g, self.r, self.b]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    /// Toggles between blue and off on every call.
    Connecting,
    Connected,
    Disconnected,
    Sensor(i32),
    Custom(Rgb),
}

pub trait PixelDriver {
    type Error;

    fn show(&mut self, colour: Rgb) -> Result<(), Self::Error>;
}

/// Driver that only remembers what it was asked to show.
#[derive(Debug, Default, Clone)]
pub struct RecordingPixel {
    pub shown: Vec<Rgb>,
}

impl PixelDriver for RecordingPixel {
    type Error = std::convert::Infallible;

    fn show(&mut self, colour: Rgb) -> Result<(), Self::Error> {
        self.shown.push(colour);
        Ok(())
    }
}

#[derive(Debug)]
pub struct StatusLed<D> {
    driver: D,
    colour: Rgb,
    brightness: u8,
    blink_on: bool,
    shown: Option<Rgb>,
}

impl<D: PixelDriver> StatusLed<D> {
    pub fn new(driver: D) -> Self {
        Self::with_brightness(driver, DEFAULT_BRIGHTNESS)
    }

    pub fn with_brightness(driver: D, brightness: u8) -> Self {
        Self {
            driver,
            colour: Rgb::OFF,
            brightness,
            blink_on: false,
            shown: None,
        }
    }

    pub fn colour(&self) -> Rgb {
        self.colour
    }

    pub fn brightness(&self) -> u8 {
        self.brightness
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn set_brightness(&mut self, brightness: u8) -> Result<(), D::Error> {
        self.brightness = brightness;
        self.push()
    }

    pub fn set_colour(&mut self, colour: Rgb) -> Result<(), D::Error> {
        self.colour = colour;
        self.push()
    }

    pub fn indicate(&mut self, indicator: Indicator) -> Result<(), D::Error> {
        let colour = match indicator {
            Indicator::Connecting => {
                self.blink_on = !self.blink_on;
                if self.blink_on {
                    Rgb::BLUE
                } else {
                    Rgb::OFF
                }
            }
            Indicator::Connected => Rgb::GREEN,
            Indicator::Disconnected => Rgb::RED,
            Indicator::Sensor(1) => Rgb::BLUE,
            Indicator::Sensor(_) => Rgb::RED,
            Indicator::Custom(colour) => colour,
        };
        if !matches!(indicator, Indicator::Connecting) {
            self.blink_on = false;
        }
        self.set_colour(colour)
    }

    fn push(&mut self) -> Result<(), D::Error> {
        let out = self.colour.scaled(self.brightness);
        if self.shown == Some(out) {
            return Ok(());
        }
        self.driver.show(out)?;
        self.shown = Some(out);
        Ok(())
    }
}

/// Reads `r`, `g` and `b` with Arduino `toInt()` semantics; missing channels
/// are 0 and out-of-range values are clamped.
pub fn parse_color(params: &HashMap<String, String>) -> Rgb {
    let channel = |key: &str| {
        params
            .get(key)
            .map(|raw| to_int(raw).clamp(0, 255) as u8)
            .unwrap_or(0)
    };
    Rgb::new(channel("r"), channel("g"), channel("b"))
}
