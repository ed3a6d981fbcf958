// GPIO, LEDC PWM and ADC1 access on the ESP32-S3, plus heap and RSSI probes

use std::collections::BTreeMap;

use device_core::command::IoCapabilities;
use device_core::error::IoError;
use device_core::health::SystemProbe;
use esp_idf_sys::*;

const PWM_FREQ_HZ: u32 = 5_000;
const PWM_CHANNELS: usize = 8;
/// ADC1 sits on GPIO1..=GPIO10 on the S3; ADC2 is shared with WiFi
const ADC1_PINS: core::ops::RangeInclusive<u8> = 1..=10;

pub struct EspBoard {
    outputs: BTreeMap<u8, u16>,
    /// Channel index = position; flag is whether the pin is attached to it
    pwm_channels: Vec<(u8, bool)>,
    pwm_timer_ready: bool,
    adc_configured: Vec<u8>,
}

impl EspBoard {
    pub fn new() -> Self {
        Self {
            outputs: BTreeMap::new(),
            pwm_channels: Vec::with_capacity(PWM_CHANNELS),
            pwm_timer_ready: false,
            adc_configured: Vec::new(),
        }
    }

    fn configure_pin(pin: u8, mode: gpio_mode_t) -> Result<(), IoError> {
        let config = gpio_config_t {
            pin_bit_mask: 1u64 << pin,
            mode,
            pull_up_en: gpio_pullup_t_GPIO_PULLUP_DISABLE,
            pull_down_en: gpio_pulldown_t_GPIO_PULLDOWN_DISABLE,
            intr_type: gpio_int_type_t_GPIO_INTR_DISABLE,
            ..Default::default()
        };
        esp!(unsafe { gpio_config(&config) }).map_err(|_| IoError::UnsupportedPin(pin))
    }

    fn pwm_channel(&mut self, pin: u8) -> Result<ledc_channel_t, IoError> {
        let idx = match self.pwm_channels.iter().position(|(p, _)| *p == pin) {
            Some(idx) if self.pwm_channels[idx].1 => return Ok(idx as ledc_channel_t),
            Some(idx) => idx,
            None if self.pwm_channels.len() == PWM_CHANNELS => {
                return Err(IoError::Hardware("no free PWM channel".into()));
            }
            None => {
                self.pwm_channels.push((pin, false));
                self.pwm_channels.len() - 1
            }
        };

        if !self.pwm_timer_ready {
            let timer = ledc_timer_config_t {
                speed_mode: ledc_mode_t_LEDC_LOW_SPEED_MODE,
                duty_resolution: ledc_timer_bit_t_LEDC_TIMER_8_BIT,
                timer_num: ledc_timer_t_LEDC_TIMER_0,
                freq_hz: PWM_FREQ_HZ,
                ..Default::default()
            };
            esp!(unsafe { ledc_timer_config(&timer) }).map_err(hw)?;
            self.pwm_timer_ready = true;
        }

        let channel = idx as ledc_channel_t;
        let config = ledc_channel_config_t {
            gpio_num: pin as i32,
            speed_mode: ledc_mode_t_LEDC_LOW_SPEED_MODE,
            channel,
            timer_sel: ledc_timer_t_LEDC_TIMER_0,
            duty: 0,
            ..Default::default()
        };
        esp!(unsafe { ledc_channel_config(&config) }).map_err(|_| IoError::UnsupportedPin(pin))?;
        self.pwm_channels[idx].1 = true;
        Ok(channel)
    }

    /// Hand a pin back to plain GPIO if it was driving PWM. The channel stays
    /// reserved for that pin.
    fn release_pwm(&mut self, pin: u8) {
        if let Some(idx) = self.pwm_channels.iter().position(|(p, on)| *p == pin && *on) {
            unsafe {
                ledc_stop(ledc_mode_t_LEDC_LOW_SPEED_MODE, idx as ledc_channel_t, 0);
            }
            self.pwm_channels[idx].1 = false;
        }
    }
}

fn hw(e: EspError) -> IoError {
    IoError::Hardware(e.to_string())
}

impl IoCapabilities for EspBoard {
    fn set_output(&mut self, pin: u8, high: bool) -> Result<(), IoError> {
        self.release_pwm(pin);
        Self::configure_pin(pin, gpio_mode_t_GPIO_MODE_INPUT_OUTPUT)?;
        esp!(unsafe { gpio_set_level(pin as gpio_num_t, u32::from(high)) }).map_err(hw)?;
        self.outputs.insert(pin, u16::from(high));
        Ok(())
    }

    fn set_pwm(&mut self, pin: u8, duty: u8) -> Result<(), IoError> {
        let channel = self.pwm_channel(pin)?;
        unsafe {
            esp!(ledc_set_duty(ledc_mode_t_LEDC_LOW_SPEED_MODE, channel, duty.into())).map_err(hw)?;
            esp!(ledc_update_duty(ledc_mode_t_LEDC_LOW_SPEED_MODE, channel)).map_err(hw)?;
        }
        self.outputs.insert(pin, duty.into());
        Ok(())
    }

    fn read_digital(&mut self, pin: u8) -> Result<bool, IoError> {
        // Driven pins are INPUT_OUTPUT and read back their own level
        if !self.outputs.contains_key(&pin) {
            Self::configure_pin(pin, gpio_mode_t_GPIO_MODE_INPUT)?;
        }
        Ok(unsafe { gpio_get_level(pin as gpio_num_t) } != 0)
    }

    fn read_analog(&mut self, pin: u8) -> Result<u16, IoError> {
        if !ADC1_PINS.contains(&pin) {
            return Err(IoError::UnsupportedPin(pin));
        }
        let channel = (pin - 1) as adc1_channel_t;
        if !self.adc_configured.contains(&pin) {
            unsafe {
                esp!(adc1_config_width(adc_bits_width_t_ADC_WIDTH_BIT_12)).map_err(hw)?;
                esp!(adc1_config_channel_atten(channel, adc_atten_t_ADC_ATTEN_DB_12)).map_err(hw)?;
            }
            self.adc_configured.push(pin);
        }
        let raw = unsafe { adc1_get_raw(channel) };
        if raw < 0 {
            return Err(IoError::Hardware(format!("adc read failed on pin {}", pin)));
        }
        Ok(raw as u16)
    }

    fn pin_states(&self) -> Vec<(u8, u16)> {
        self.outputs.iter().map(|(pin, level)| (*pin, *level)).collect()
    }
}

impl SystemProbe for EspBoard {
    fn free_heap(&self) -> u32 {
        unsafe { esp_get_free_heap_size() }
    }

    fn rssi_dbm(&self) -> Option<i8> {
        station_rssi()
    }
}

/// Signal of the associated AP, `None` while not associated
pub fn station_rssi() -> Option<i8> {
    unsafe {
        let mut ap_info: wifi_ap_record_t = std::mem::zeroed();
        if esp_wifi_sta_get_ap_info(&mut ap_info) == ESP_OK {
            Some(ap_info.rssi)
        } else {
            None
        }
    }
}

/// Link indicator LED: lit while the broker session is up
pub struct StatusLed {
    pin: u8,
    lit: Option<bool>,
}

impl StatusLed {
    pub fn new(pin: u8) -> Result<Self, IoError> {
        EspBoard::configure_pin(pin, gpio_mode_t_GPIO_MODE_OUTPUT)?;
        Ok(Self { pin, lit: None })
    }

    pub fn set(&mut self, on: bool) {
        if self.lit == Some(on) {
            return;
        }
        unsafe {
            gpio_set_level(self.pin as gpio_num_t, u32::from(on));
        }
        self.lit = Some(on);
    }
}
