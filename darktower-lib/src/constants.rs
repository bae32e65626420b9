// Protocol constants for the tower

/// Size of the packed tower state payload (19 bytes)
pub const STATE_PAYLOAD_SIZE: usize = 19;

/// Size of the command discriminator that prefixes every frame (1 byte)
pub const FRAME_HEADER_SIZE: usize = 1;

/// Size of an outbound state command and of an inbound state report (20 bytes)
pub const STATE_FRAME_SIZE: usize = FRAME_HEADER_SIZE + STATE_PAYLOAD_SIZE;

/// Minimum size of a battery frame (voltage lives in bytes 3 and 4)
pub const BATTERY_FRAME_MIN_SIZE: usize = 5;

/// Number of rotating drums
pub const DRUM_COUNT: usize = 3;

/// Number of light layers (3 rings + ledge + 2 base layers)
pub const LAYER_COUNT: usize = 6;

/// Light slots per layer
pub const LIGHTS_PER_LAYER: usize = 4;

/// Highest audio sample index (7 bits)
pub const MAX_AUDIO_SAMPLE: u8 = 0x7F;

/// Highest value the 4-bit volume nibble can carry. The device uses 0 (loudest) to 3.
pub const MAX_AUDIO_VOLUME: u8 = 0x0F;

/// Single-cell millivolt thresholds, highest first. Each step is 5%.
pub const BATTERY_VOLTAGE_LEVELS: [u16; 20] = [
    1500, 1390, 1350, 1320, 1295, 1270, 1245, 1225, 1205, 1185, 1165, 1145, 1125, 1105, 1085, 1065, 1045, 1025, 1000,
    980,
];

/// The pack reports total millivolts for three cells in series
pub const BATTERY_CELL_COUNT: u16 = 3;

/// Percentage represented by one threshold step
pub const BATTERY_PERCENT_STEP: u8 = 5;

// Defaults, all overridable through `TowerConfig`

pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_LONG_OPERATION_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_SEND_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_DELAY_STEP_MS: u64 = 250;
pub const DEFAULT_BATTERY_NOTIFY_INTERVAL_MS: u64 = 15_000;

/// Advertised name of the tower
pub const DEFAULT_DEVICE_NAME: &str = "ReturnToDarkTower";

/// Nordic UART service exposed by the tower
pub const UART_SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";

/// Device information service
pub const DEVICE_INFO_SERVICE_UUID: &str = "0000180a-0000-1000-8000-00805f9b34fb";
