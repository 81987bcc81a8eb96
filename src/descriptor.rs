//! Reader descriptor: everything the driver knows about one physical
//! interface device, derived from the USB CCID class descriptor (or a serial
//! personality) and then mutated by the per-reader quirks.

use std::time::Duration;

/// dwFeatures bits from the CCID class descriptor.
pub const FEATURE_AUTO_CONF_ATR: u32 = 0x0000_0002;
pub const FEATURE_AUTO_ACTIVATION: u32 = 0x0000_0004;
pub const FEATURE_AUTO_VOLTAGE: u32 = 0x0000_0008;
pub const FEATURE_AUTO_BAUD: u32 = 0x0000_0020;
pub const FEATURE_AUTO_PPS_PROP: u32 = 0x0000_0040;
pub const FEATURE_AUTO_PPS_CUR: u32 = 0x0000_0080;
pub const FEATURE_CLOCK_STOP: u32 = 0x0000_0100;
pub const FEATURE_NAD_NONZERO: u32 = 0x0000_0200;
pub const FEATURE_AUTO_IFSD: u32 = 0x0000_0400;

pub const FEATURE_EXCHANGE_MASK: u32 = 0x0007_0000;
pub const FEATURE_CHARACTER: u32 = 0x0000_0000;
pub const FEATURE_TPDU: u32 = 0x0001_0000;
pub const FEATURE_SHORT_APDU: u32 = 0x0002_0000;
pub const FEATURE_EXTENDED_APDU: u32 = 0x0004_0000;

/// bPINSupport bits.
pub const PIN_SUPPORT_VERIFY: u8 = 0x01;
pub const PIN_SUPPORT_MODIFY: u8 = 0x02;

/// bVoltageSupport bits.
pub const VOLTAGE_SUPPORT_5V: u8 = 0x01;
pub const VOLTAGE_SUPPORT_3V: u8 = 0x02;
pub const VOLTAGE_SUPPORT_1_8V: u8 = 0x04;

/// Default communication read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// All the data rates specified by the ISO 7816-3 Fi/Di tables, used as the
/// supported-rate list of the serial readers.
pub const ISO_DATA_RATES: &[u32] = &[
    10753, 14337, 15625, 17204, 20833, 21505, 23438, 25806, 28674, 31250, 32258, 34409, 39063,
    41667, 43011, 46875, 52083, 53763, 57348, 62500, 64516, 68817, 71685, 78125, 83333, 86022,
    93750, 104167, 107527, 114695, 125000, 129032, 143369, 156250, 166667, 172043, 215054, 229391,
    250000, 344086,
];

/// Framing class: plain CCID over bulk, or one of the two ICCD variants
/// that run everything through control transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingClass {
    Ccid,
    IccdA,
    IccdB,
}

/// Exchange level advertised by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeClass {
    Character,
    Tpdu,
    ShortApdu,
    ExtendedApdu,
}

impl ExchangeClass {
    pub fn from_features(features: u32) -> ExchangeClass {
        match features & FEATURE_EXCHANGE_MASK {
            FEATURE_TPDU => ExchangeClass::Tpdu,
            FEATURE_SHORT_APDU => ExchangeClass::ShortApdu,
            FEATURE_EXTENDED_APDU => ExchangeClass::ExtendedApdu,
            _ => ExchangeClass::Character,
        }
    }
}

/// Card protocol selected after ATR/PPS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardProtocol {
    T0,
    T1,
}

/// Vendor firmware feature record, loaded through a vendor escape on
/// readers that support it. The wire layout is a fixed 21-byte structure.
#[derive(Debug, Clone, Default)]
pub struct FirmwareFeatures {
    pub lcd_lines: u8,
    pub lcd_columns: u8,
    pub entry_validation_condition: u8,
    pub verify_pin_direct: bool,
    pub modify_pin_direct: bool,
    pub get_key_pressed: bool,
    pub number_message_fix: bool,
    pub min_pin_size: u8,
    pub max_pin_size: u8,
}

impl FirmwareFeatures {
    pub const WIRE_SIZE: usize = 21;

    /// Decode the record; the escape is considered unsupported unless the
    /// response has exactly the expected size.
    pub fn parse(data: &[u8]) -> Option<FirmwareFeatures> {
        if data.len() != Self::WIRE_SIZE {
            return None;
        }
        Some(FirmwareFeatures {
            lcd_lines: data[0],
            lcd_columns: data[1],
            entry_validation_condition: data[3],
            get_key_pressed: data[4] & 0x10 != 0,
            verify_pin_direct: data[4] & 0x20 != 0,
            modify_pin_direct: data[4] & 0x40 != 0,
            number_message_fix: data[8] & 0x04 != 0,
            min_pin_size: data[13],
            max_pin_size: data[14],
        })
    }
}

/// One per open device; shared by all slots of a multi-slot reader.
#[derive(Debug, Clone)]
pub struct ReaderDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,

    pub framing: FramingClass,
    /// dwFeatures from the class descriptor; exchange class and automation
    /// capabilities are all derived from here.
    pub features: u32,

    pub max_message_length: u32,
    pub max_ifsd: u32,
    /// kHz.
    pub default_clock: u32,
    pub max_data_rate: u32,
    pub data_rates: Option<Vec<u32>>,

    pub max_slot_index: u8,
    /// The reader reports a card present even with an empty slot; presence
    /// is then inferred from power-up results instead.
    pub card_forced_present: bool,
    /// Set after a failed power-up on such a reader: report the card absent
    /// until a power-up succeeds.
    pub forced_absent: bool,

    pub voltage_support: u8,
    pub pin_support: u8,
    pub lcd_layout: u16,

    /// Current communication read timeout; mutated (with save and restore)
    /// by secure PIN entry and WTX handling.
    pub read_timeout: Duration,
    pub card_protocol: Option<CardProtocol>,

    pub firmware_features: Option<FirmwareFeatures>,

    /// Append a zero-length packet after writes that fill a wMaxPacketSize
    /// boundary (workaround for specific firmwares on USB-3 hosts).
    pub zero_length_packet: bool,

    /// Receive path must split reads that would be a multiple of 64 bytes.
    pub split_modulo_64_reads: bool,
}

impl ReaderDescriptor {
    /// (vendorId << 16) | productId, the key of the quirk table.
    pub fn reader_id(&self) -> u32 {
        (u32::from(self.vendor_id) << 16) | u32::from(self.product_id)
    }

    pub fn exchange_class(&self) -> ExchangeClass {
        ExchangeClass::from_features(self.features)
    }

    pub fn has_feature(&self, bit: u32) -> bool {
        self.features & bit != 0
    }

    pub fn is_char_level(&self) -> bool {
        self.exchange_class() == ExchangeClass::Character
    }

    /// Largest APDU chunk a single XfrBlock can carry.
    pub fn max_block_payload(&self) -> usize {
        (self.max_message_length as usize).saturating_sub(crate::ccid::HEADER_SIZE)
    }

    /// True when `rate` is in the supported-rate table, within the +/-2
    /// tolerance the integral baud computation requires.
    pub fn supports_data_rate(&self, rate: u32) -> bool {
        match &self.data_rates {
            None => true,
            Some(list) => list.iter().any(|&r| rate + 2 > r && rate < r + 2),
        }
    }
}

impl Default for ReaderDescriptor {
    fn default() -> Self {
        ReaderDescriptor {
            vendor_id: 0,
            product_id: 0,
            bcd_device: 0,
            manufacturer: None,
            product: None,
            serial_number: None,
            framing: FramingClass::Ccid,
            features: FEATURE_TPDU,
            max_message_length: 271,
            max_ifsd: 254,
            default_clock: 4000,
            max_data_rate: 344_086,
            data_rates: None,
            max_slot_index: 0,
            card_forced_present: false,
            forced_absent: false,
            voltage_support: VOLTAGE_SUPPORT_5V | VOLTAGE_SUPPORT_3V | VOLTAGE_SUPPORT_1_8V,
            pin_support: 0,
            lcd_layout: 0,
            read_timeout: DEFAULT_READ_TIMEOUT,
            card_protocol: None,
            firmware_features: None,
            zero_length_packet: false,
            split_modulo_64_reads: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_id_packs_vendor_and_product() {
        let desc = ReaderDescriptor {
            vendor_id: 0x08E6,
            product_id: 0x3437,
            ..Default::default()
        };
        assert_eq!(desc.reader_id(), 0x08E6_3437);
    }

    #[test]
    fn exchange_class_from_features() {
        assert_eq!(ExchangeClass::from_features(0x0001_0230), ExchangeClass::Tpdu);
        assert_eq!(
            ExchangeClass::from_features(0x0004_0000),
            ExchangeClass::ExtendedApdu
        );
        assert_eq!(ExchangeClass::from_features(0), ExchangeClass::Character);
    }

    #[test]
    fn data_rate_tolerance() {
        let desc = ReaderDescriptor {
            data_rates: Some(vec![9600, 115_200]),
            ..Default::default()
        };
        assert!(desc.supports_data_rate(9600));
        assert!(desc.supports_data_rate(9601));
        assert!(!desc.supports_data_rate(9603));

        let no_table = ReaderDescriptor::default();
        assert!(no_table.supports_data_rate(500_000));
    }
}
