//! Hardware abstraction for supported boards.
//!
//! Each board module defines pin assignments and capabilities
//! selected at compile time via feature flags.

#[cfg(feature = "board-xiao")]
mod hw {
    pub const BUZZER_PIN: u8 = 8;
    pub const BUZZER_FREQ_HZ: u32 = 3200;
    pub const MESH_RX_PIN: u8 = 4;
    pub const MESH_TX_PIN: u8 = 5;
    pub const VIBRATION_PIN: u8 = 1; // SW-420
    pub const TEMP_SENSOR_PIN: u8 = 6; // DS18B20
    pub const RTC_SDA_PIN: u8 = 3;
    pub const RTC_SCL_PIN: u8 = 2;
    pub const GPS_RX_PIN: u8 = 44;
    pub const GPS_TX_PIN: u8 = 43;
    pub const SD_CS_PIN: u8 = 15;
    pub const SD_CLK_PIN: u8 = 23;
    pub const SD_MISO_PIN: u8 = 33;
    pub const SD_MOSI_PIN: u8 = 19;
    pub const HAS_GPS_HEADER: bool = true;
    pub const HAS_RTC: bool = true;
    pub const HAS_SD: bool = true;
    pub const BOARD_NAME: &str = "xiao_esp32s3";
}

#[cfg(feature = "board-m5atom")]
mod hw {
    pub const BUZZER_PIN: u8 = 26;
    pub const BUZZER_FREQ_HZ: u32 = 3200;
    pub const MESH_RX_PIN: u8 = 32;
    pub const MESH_TX_PIN: u8 = 25;
    pub const VIBRATION_PIN: u8 = 39;
    pub const HAS_GPS_HEADER: bool = false;
    pub const HAS_RTC: bool = false;
    pub const HAS_SD: bool = false;
    pub const BOARD_NAME: &str = "m5atom";
}

#[cfg(not(any(feature = "board-xiao", feature = "board-m5atom")))]
mod hw {
    pub const BOARD_NAME: &str = "unknown";
}

pub use hw::*;
