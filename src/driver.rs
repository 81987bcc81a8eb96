//! Resource-manager facing driver facade.
//!
//! A [`Driver`] is a registry of channels: the resource manager hands us an
//! opaque handle per channel, we route it to a slot of an open device.
//! Multi-slot readers share one [`Device`] (port, descriptor, sequence
//! counter) behind a mutex; slots of one device are therefore not
//! independently thread-safe, which the capability tags advertise.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::atr::{Atr, Convention};
use crate::ccid::MAX_ATR_SIZE;
use crate::commands::{
    xfr_block_t1, CmdError, Device, Slot, MASK_POWERFLAGS_PDWN, MASK_POWERFLAGS_PUP,
};
use crate::config::Config;
use crate::descriptor::{
    CardProtocol, ExchangeClass, ReaderDescriptor, FEATURE_AUTO_IFSD, FEATURE_AUTO_PPS_CUR,
    FEATURE_AUTO_PPS_PROP,
};
use crate::error::{IfdError, IfdResult};
use crate::pps;
use crate::quirks;
use crate::secure_pin;
use crate::t0;
use crate::t1::ChecksumKind;
use crate::transport::{CcidPort, PortError};
use crate::{serial_port, usb_port};

/// Maximum number of readers handled simultaneously.
pub const MAX_READERS: usize = 16;

/// Capability tags understood by `get_capabilities`.
pub mod tags {
    pub const TAG_IFD_ATR: u32 = 0x0303;
    pub const TAG_IFD_SLOT_THREAD_SAFE: u32 = 0x0FAC;
    pub const TAG_IFD_THREAD_SAFE: u32 = 0x0FAD;
    pub const TAG_IFD_SLOTS_NUMBER: u32 = 0x0FAE;
    pub const TAG_IFD_SIMULTANEOUS_ACCESS: u32 = 0x0FAF;

    pub const SCARD_ATTR_ATR_STRING: u32 = 0x0009_0303;
    pub const SCARD_ATTR_VENDOR_NAME: u32 = 0x0001_0100;
    pub const SCARD_ATTR_VENDOR_IFD_VERSION: u32 = 0x0001_0102;
    pub const SCARD_ATTR_VENDOR_IFD_SERIAL_NO: u32 = 0x0001_0103;
    pub const SCARD_ATTR_MAXINPUT: u32 = 0x0007_A007;
    pub const SCARD_ATTR_ICC_PRESENCE: u32 = 0x0009_0300;
    pub const SCARD_ATTR_ICC_INTERFACE_STATUS: u32 = 0x0009_0301;
}

/// Control codes of the `control` surface.
#[allow(non_upper_case_globals)]
pub mod control_codes {
    const fn scard_ctl_code(code: u32) -> u32 {
        0x4200_0000 + code
    }

    pub const IOCTL_SMARTCARD_VENDOR_IFD_EXCHANGE: u32 = scard_ctl_code(1);
    pub const CM_IOCTL_GET_FEATURE_REQUEST: u32 = scard_ctl_code(3400);

    pub const FEATURE_VERIFY_PIN_DIRECT: u8 = 0x06;
    pub const FEATURE_MODIFY_PIN_DIRECT: u8 = 0x07;
    pub const FEATURE_MCT_READER_DIRECT: u8 = 0x08;
    pub const FEATURE_IFD_PIN_PROPERTIES: u8 = 0x0A;
    pub const FEATURE_GET_TLV_PROPERTIES: u8 = 0x12;
    pub const FEATURE_CCID_ESC_COMMAND: u8 = 0x13;

    const CLASS2_IOCTL_MAGIC: u32 = 0x0033_0000;

    pub const fn feature_ioctl(feature: u8) -> u32 {
        scard_ctl_code(CLASS2_IOCTL_MAGIC + feature as u32)
    }

    /// Part-10 property tags.
    pub const PROPERTY_wLcdLayout: u8 = 1;
    pub const PROPERTY_bEntryValidationCondition: u8 = 2;
    pub const PROPERTY_bTimeOut2: u8 = 3;
    pub const PROPERTY_bMinPINSize: u8 = 6;
    pub const PROPERTY_bMaxPINSize: u8 = 7;
    pub const PROPERTY_bPPDUSupport: u8 = 9;
    pub const PROPERTY_dwMaxAPDUDataSize: u8 = 10;
    pub const PROPERTY_wIdVendor: u8 = 11;
    pub const PROPERTY_wIdProduct: u8 = 12;
}

/// PPS negotiation flags of `set_protocol_parameters`.
pub const NEGOTIATE_PTS1: u8 = 1;
pub const NEGOTIATE_PTS2: u8 = 2;
pub const NEGOTIATE_PTS3: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    PowerUp,
    PowerDown,
    Reset,
}

#[derive(Clone)]
struct Channel {
    device: Arc<Mutex<Device>>,
    slot_index: usize,
    key: String,
}

#[derive(Default)]
struct Registry {
    channels: HashMap<u32, Channel>,
    devices: HashMap<String, Weak<Mutex<Device>>>,
}

pub struct Driver {
    registry: Mutex<Registry>,
    config: Config,
}

impl Default for Driver {
    fn default() -> Self {
        Driver::new(Config::default())
    }
}

impl Driver {
    pub fn new(config: Config) -> Driver {
        Driver {
            registry: Mutex::new(Registry::default()),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open the `channel`-th USB reader.
    pub fn create_channel(&self, handle: u32, channel: u32) -> IfdResult<()> {
        let key = format!("usb-index:{channel}");
        let (port, desc) = usb_port::open_by_index(channel as usize).map_err(map_port_error)?;
        self.create_channel_with_port(handle, Box::new(port), desc, &key)
    }

    /// Open a channel from a device string: `usb:VVVV/PPPP...` or a serial
    /// `device[:reader-name]` path.
    pub fn create_channel_by_name(&self, handle: u32, device_string: &str) -> IfdResult<()> {
        // A second channel on a device we already drive attaches to the
        // next slot instead of opening the hardware again.
        if self.attach_secondary_slot(handle, device_string)? {
            return Ok(());
        }

        if device_string.starts_with("usb:") {
            let (port, desc) = usb_port::open_by_name(device_string).map_err(map_port_error)?;
            self.create_channel_with_port(handle, Box::new(port), desc, device_string)
        } else {
            let device = serial_port::open_by_name(device_string).map_err(map_cmd_error)?;
            self.install_device(handle, device, device_string)
        }
    }

    /// Install a freshly opened port as a channel. Public so alternative
    /// back-ends (and the protocol tests) can feed a transport in.
    pub fn create_channel_with_port(
        &self,
        handle: u32,
        port: Box<dyn CcidPort>,
        desc: ReaderDescriptor,
        key: &str,
    ) -> IfdResult<()> {
        self.install_device(handle, Device::new(port, desc), key)
    }

    fn install_device(&self, handle: u32, mut device: Device, key: &str) -> IfdResult<()> {
        {
            let registry = self.registry.lock().unwrap();
            if registry.channels.contains_key(&handle) {
                return Err(IfdError::Communication);
            }
            if registry.channels.len() >= MAX_READERS {
                log::error!("too many readers open");
                return Err(IfdError::Communication);
            }
        }

        // Open sequence: pre-open quirks, a status probe to check the
        // reader actually talks, then post-open quirks. Nothing is
        // registered until all of it worked, so a failure leaks no state.
        quirks::apply_pre_open(&mut device, &self.config).map_err(map_cmd_error)?;
        let zlp = device.desc.zero_length_packet;
        device.port.set_zero_length_packet(zlp);

        device.slot_status(0).map_err(map_cmd_error)?;

        quirks::apply_post_open(&mut device, &self.config).map_err(map_cmd_error)?;

        device.slots.push(Slot::new(0, key.to_string()));

        let device = Arc::new(Mutex::new(device));
        let mut registry = self.registry.lock().unwrap();
        registry
            .devices
            .insert(key.to_string(), Arc::downgrade(&device));
        registry.channels.insert(
            handle,
            Channel {
                device,
                slot_index: 0,
                key: key.to_string(),
            },
        );
        Ok(())
    }

    /// Attach to the next slot of an already-open multi-slot device.
    fn attach_secondary_slot(&self, handle: u32, key: &str) -> IfdResult<bool> {
        let mut registry = self.registry.lock().unwrap();
        if registry.channels.contains_key(&handle) {
            return Err(IfdError::Communication);
        }

        let device = match registry.devices.get(key).and_then(Weak::upgrade) {
            Some(device) => device,
            None => return Ok(false),
        };

        let slot_index;
        {
            let mut dev = device.lock().unwrap();
            let next = dev.slots.len() as u8;
            if next > dev.desc.max_slot_index {
                log::error!("trying to open too many slots on {key}");
                return Err(IfdError::Communication);
            }
            log::info!("opening slot {next} on {key}");
            slot_index = dev.slots.len();
            dev.slots.push(Slot::new(next, format!("{key} slot {next}")));
        }

        registry.channels.insert(
            handle,
            Channel {
                device,
                slot_index,
                key: key.to_string(),
            },
        );
        Ok(true)
    }

    fn channel(&self, handle: u32) -> IfdResult<Channel> {
        self.registry
            .lock()
            .unwrap()
            .channels
            .get(&handle)
            .cloned()
            .ok_or(IfdError::UnknownHandle)
    }

    /// Close a channel: best-effort power down, then release the slot and,
    /// on the last slot, the device.
    pub fn close_channel(&self, handle: u32) -> IfdResult<()> {
        let channel = {
            let mut registry = self.registry.lock().unwrap();
            let channel = registry
                .channels
                .remove(&handle)
                .ok_or(IfdError::UnknownHandle)?;

            let last = !registry.channels.values().any(|c| c.key == channel.key);
            if last {
                registry.devices.remove(&channel.key);
            }
            channel
        };

        let mut dev = channel.device.lock().unwrap();
        let slot_number = dev.slots[channel.slot_index].index;
        if let Err(e) = dev.power_off(slot_number) {
            log::debug!("power off at close failed: {e}");
        }
        let slot = &mut dev.slots[channel.slot_index];
        slot.atr.clear();
        slot.t1 = crate::t1::T1State::new();

        if self.config.reset_on_close() {
            dev.port.reset();
        }

        Ok(())
    }

    /// Power the card up or down, or reset it. Returns the ATR for up and
    /// reset, empty for down.
    pub fn power_icc(&self, handle: u32, action: PowerAction) -> IfdResult<Vec<u8>> {
        let channel = self.channel(handle)?;
        let mut dev = channel.device.lock().unwrap();
        let dev = &mut *dev;
        let slot_number = dev.slots[channel.slot_index].index;

        match action {
            PowerAction::PowerDown => {
                let slot = &mut dev.slots[channel.slot_index];
                slot.atr.clear();
                slot.power_flags |= MASK_POWERFLAGS_PDWN;

                if dev.power_off(slot_number).is_err() {
                    log::error!("power down failed");
                    return Err(IfdError::PowerAction);
                }
                dev.slots[channel.slot_index].t1 = crate::t1::T1State::new();
                Ok(Vec::new())
            }

            PowerAction::PowerUp | PowerAction::Reset => {
                // This card refuses a power-up while powered.
                if dev.desc.reader_id() == quirks::KOBIL_IDTOKEN && dev.power_off(slot_number).is_err() {
                    log::error!("power down before power up failed");
                    return Err(IfdError::PowerAction);
                }

                // The ATR itself may take (9600+12)*33 ETU; with a 4 MHz
                // clock that is close to half a minute.
                let old_timeout = dev.desc.read_timeout;
                dev.desc.read_timeout = Duration::from_secs(60);
                let powered = dev.power_on(slot_number, self.config.power_on_voltage());
                dev.desc.read_timeout = old_timeout;

                let atr = match powered {
                    Ok(atr) => atr,
                    Err(e) => {
                        if dev.desc.card_forced_present {
                            dev.desc.forced_absent = true;
                        }
                        log::error!("power up failed: {e}");
                        return Err(IfdError::PowerAction);
                    }
                };

                dev.desc.forced_absent = false;

                let slot = &mut dev.slots[channel.slot_index];
                slot.power_flags |= MASK_POWERFLAGS_PUP;
                slot.power_flags &= !MASK_POWERFLAGS_PDWN;

                let mut atr = atr;
                atr.truncate(MAX_ATR_SIZE);
                slot.atr = atr.clone();
                slot.t1 = crate::t1::T1State::new();

                Ok(atr)
            }
        }
    }

    /// Run PPS with the card and program the reader with the resulting
    /// parameters; the card-derived read timeout is installed here.
    pub fn set_protocol_parameters(
        &self,
        handle: u32,
        protocol: CardProtocol,
        flags: u8,
        pts1: u8,
        pts2: u8,
        pts3: u8,
    ) -> IfdResult<()> {
        let channel = self.channel(handle)?;
        let mut dev = channel.device.lock().unwrap();
        let dev = &mut *dev;
        let slot_number = dev.slots[channel.slot_index].index;

        // The reader negotiates everything by itself.
        if dev.desc.has_feature(FEATURE_AUTO_PPS_PROP) {
            dev.desc.card_protocol = Some(protocol);
            return Ok(());
        }

        let mut atr = match dev.slots[channel.slot_index].parsed_atr() {
            Some(atr) => atr,
            None => return Err(IfdError::ProtocolNotSupported),
        };

        extra_egt(&mut atr, &dev.desc, protocol);

        let protocol_nibble = match protocol {
            CardProtocol::T0 => 0u8,
            CardProtocol::T1 => 1u8,
        };

        // TA2 present: the card is in specific mode and will only talk the
        // protocol TA2 announces.
        if let Some(specific) = atr.specific_mode() {
            if specific != protocol_nibble {
                log::info!("specific mode T={specific}, T={protocol_nibble} requested");
                return Err(IfdError::ProtocolNotSupported);
            }
        }

        // TCi (i >= 3) selects the T=1 error detection code.
        if protocol == CardProtocol::T1 {
            let t1 = &mut dev.slots[channel.slot_index].t1;
            match atr.t1_crc() {
                Some(true) => t1.set_checksum(ChecksumKind::Crc),
                Some(false) | None => t1.set_checksum(ChecksumKind::Lrc),
            }
        }

        // Decide on a PPS1 proposal.
        let mut pps1_value: Option<u8> = None;
        if flags & NEGOTIATE_PTS1 != 0 {
            pps1_value = Some(pts1);
        } else if let Some(ta1) = atr.interface_byte(1, crate::atr::InterfaceByte::Ta) {
            let card_baud = baud_rate(&dev.desc, atr.f(), atr.d());
            let default_baud = baud_rate(&dev.desc, 372, 1);

            if card_baud > default_baud && card_baud <= dev.desc.max_data_rate {
                if dev.desc.supports_data_rate(card_baud) {
                    log::debug!("set speed to {card_baud} bauds");
                    pps1_value = Some(ta1);
                } else {
                    log::debug!("reader does not support {card_baud} bauds");
                    // Specific mode cards only ever run at TA1 speed; a
                    // reader that cannot do it cannot talk to the card.
                    if atr.specific_mode().is_some() {
                        return Err(IfdError::Communication);
                    }
                }
            } else if card_baud > dev.desc.max_data_rate + 2 && ta1 <= 0x97 {
                // The card outruns the reader: walk TA1 down looking for a
                // speed both sides can do.
                let mut candidate = ta1;
                while candidate > 0x94 {
                    candidate -= 1;
                    atr.set_ta1(candidate);
                    let baud = baud_rate(&dev.desc, atr.f(), atr.d());
                    let supported = match &dev.desc.data_rates {
                        Some(_) => dev.desc.supports_data_rate(baud),
                        None => baud <= dev.desc.max_data_rate,
                    };
                    if supported {
                        log::debug!("set adapted speed to {baud} bauds");
                        pps1_value = Some(candidate);
                        break;
                    }
                }
                atr.set_ta1(ta1);
            }
        }

        let pps2_value = (flags & NEGOTIATE_PTS2 != 0).then_some(pts2);
        let pps3_value = (flags & NEGOTIATE_PTS3 != 0).then_some(pts3);

        // Run the PPS unless the reader does it, or the card's mode forbids
        // it.
        let mut negotiated_pps1: Option<u8> = pps1_value;
        if !dev.desc.has_feature(FEATURE_AUTO_PPS_CUR) && atr.specific_mode().is_none() {
            let default_protocol = atr.default_protocol();
            if protocol_nibble != default_protocol || pps1_value.is_some() {
                let request = pps::build_request(protocol_nibble, pps1_value, pps2_value, pps3_value);
                match pps::exchange(dev, slot_number, &request) {
                    Ok(outcome) => negotiated_pps1 = Some(outcome.pps1),
                    Err(e) => {
                        log::info!("PPS exchange failed: {e}");
                        return Err(IfdError::PtsFailure);
                    }
                }
            }
        }

        let convention = atr
            .convention()
            .map_err(|_| IfdError::ProtocolNotSupported)?;

        // Specific mode with implicit parameters (b5 of TA2) cannot be
        // programmed into a CCID reader.
        if let Some(ta2) = atr.interface_byte(2, crate::atr::InterfaceByte::Ta) {
            if ta2 & 0x10 != 0 {
                return Err(IfdError::Communication);
            }
        }

        let fi_di = negotiated_pps1.unwrap_or(pps::DEFAULT_TA1);

        match protocol {
            CardProtocol::T1 => {
                let mut param = [
                    0x11, // Fi/Di
                    0x10, // TCCKS
                    0x00, // GuardTime
                    0x4D, // BWI/CWI
                    0x00, // ClockStop
                    0x20, // IFSC
                    0x00, // NADValue
                ];
                param[0] = fi_di;

                if dev.slots[channel.slot_index].t1.checksum() == ChecksumKind::Crc {
                    param[1] |= 0x01;
                }
                if convention == Convention::Inverse {
                    param[1] |= 0x02;
                }
                if let Some(tc1) = atr.tc1() {
                    param[2] = tc1;
                }

                if let Some((bwi, cwi)) = atr.bwi_cwi() {
                    param[3] = (bwi << 4) | cwi;

                    // The OpenPGP card needs a BWT of 11 s instead of 1.4 s
                    // to survive its on-board key generation.
                    const OPENPGP_ATR: &[u8] = &[
                        0x3B, 0xFA, 0x13, 0x00, 0xFF, 0x81, 0x31, 0x80, 0x45, 0x00, 0x31, 0xC1,
                        0x73, 0xC0, 0x01, 0x00, 0x00, 0x90, 0x00, 0xB1,
                    ];
                    if dev.slots[channel.slot_index].atr == OPENPGP_ATR {
                        param[3] = 0x75;
                        log::debug!("OpenPGP hack, using 0x{:02X}", param[3]);
                    }
                }

                dev.desc.read_timeout = t1_card_timeout(
                    atr.f() as f64,
                    atr.d() as f64,
                    param[2],
                    param[3] >> 4,
                    param[3] & 0x0F,
                    dev.desc.default_clock,
                );
                log::debug!("timeout: {:?}", dev.desc.read_timeout);

                if let Some((position, ifsc)) = atr.ifsc() {
                    log::debug!("IFSC (TA{position}) present: {ifsc}");
                    param[5] = ifsc;
                }

                dev.set_parameters(slot_number, 1, &param)
                    .map_err(map_cmd_error)?;

                // Install IFSC, then negotiate our IFSD with the card when
                // the reader does not do it itself.
                if let Some((_, ifsc)) = atr.ifsc() {
                    dev.slots[channel.slot_index].t1.ifsc = usize::from(ifsc);
                }

                if !dev.desc.has_feature(FEATURE_AUTO_IFSD) {
                    let ifsd = dev.desc.max_ifsd.min(254) as u8;
                    log::debug!("negotiate IFSD at {ifsd}");
                    let mut t1 = std::mem::take(&mut dev.slots[channel.slot_index].t1);
                    let result = {
                        let mut link = dev.t1_link(slot_number);
                        t1.negotiate_ifsd(&mut link, ifsd)
                    };
                    dev.slots[channel.slot_index].t1 = t1;
                    if result.is_err() {
                        return Err(IfdError::Communication);
                    }
                }
            }

            CardProtocol::T0 => {
                let mut param = [
                    0x11, // Fi/Di
                    0x00, // TCCKS
                    0x00, // GuardTime
                    0x0A, // WaitingInteger
                    0x00, // ClockStop
                ];
                param[0] = fi_di;

                if convention == Convention::Inverse {
                    param[1] |= 0x02;
                }
                if let Some(tc1) = atr.tc1() {
                    param[2] = tc1;
                }
                if let Some(tc2) = atr.tc2() {
                    param[3] = tc2;
                }

                dev.desc.read_timeout = t0_card_timeout(
                    atr.f() as f64,
                    atr.d() as f64,
                    param[2],
                    param[3],
                    dev.desc.default_clock,
                );
                log::debug!("timeout: {:?}", dev.desc.read_timeout);

                dev.set_parameters(slot_number, 0, &param)
                    .map_err(map_cmd_error)?;
            }
        }

        dev.desc.card_protocol = Some(protocol);
        Ok(())
    }

    /// Exchange one APDU with the card. `rx_limit` is the caller's receive
    /// buffer size.
    pub fn transmit(&self, handle: u32, tx: &[u8], rx_limit: usize) -> IfdResult<Vec<u8>> {
        let channel = self.channel(handle)?;
        let mut dev = channel.device.lock().unwrap();
        let dev = &mut *dev;

        if dev.slots[channel.slot_index].atr.is_empty() {
            return Err(IfdError::IccNotPresent);
        }
        let protocol = dev
            .desc
            .card_protocol
            .unwrap_or(CardProtocol::T0);
        let slot_number = dev.slots[channel.slot_index].index;

        let result = match (protocol, dev.desc.exchange_class()) {
            (CardProtocol::T0, ExchangeClass::Tpdu | ExchangeClass::ShortApdu) => {
                dev.xfr_block_tpdu(slot_number, tx)
            }
            (CardProtocol::T0, ExchangeClass::Character) => {
                t0::xfr_block_char_t0(dev, slot_number, tx)
            }
            (CardProtocol::T1, ExchangeClass::Tpdu | ExchangeClass::Character) => {
                xfr_block_t1(dev, channel.slot_index, tx, rx_limit)
            }
            (CardProtocol::T1, ExchangeClass::ShortApdu) => dev.xfr_block_tpdu(slot_number, tx),
            (_, ExchangeClass::ExtendedApdu) => dev.xfr_block_extended(slot_number, tx),
        };

        let rx = result.map_err(map_cmd_error)?;
        if rx.len() > rx_limit {
            return Err(IfdError::InsufficientBuffer);
        }
        Ok(rx)
    }

    /// PC/SC v2 part 10 control surface.
    pub fn control(&self, handle: u32, code: u32, tx: &[u8], rx_limit: usize) -> IfdResult<Vec<u8>> {
        use control_codes::*;

        let channel = self.channel(handle)?;
        let mut dev = channel.device.lock().unwrap();
        let dev = &mut *dev;

        let rx = if code == CM_IOCTL_GET_FEATURE_REQUEST {
            self.feature_list(dev)
        } else if code == feature_ioctl(FEATURE_VERIFY_PIN_DIRECT) {
            secure_pin::verify(dev, channel.slot_index, tx).map_err(map_cmd_error)?
        } else if code == feature_ioctl(FEATURE_MODIFY_PIN_DIRECT) {
            secure_pin::modify(dev, channel.slot_index, tx).map_err(map_cmd_error)?
        } else if code == feature_ioctl(FEATURE_IFD_PIN_PROPERTIES) {
            if dev.desc.pin_support == 0 {
                return Err(IfdError::NotSupported);
            }
            // wLcdLayout, bEntryValidationCondition, bTimeOut2.
            let mut out = dev.desc.lcd_layout.to_le_bytes().to_vec();
            out.push(0x07);
            out.push(0x00);
            out
        } else if code == feature_ioctl(FEATURE_GET_TLV_PROPERTIES) {
            self.property_tlvs(dev)
        } else if code == IOCTL_SMARTCARD_VENDOR_IFD_EXCHANGE {
            if !self.config.allow_escape_exchange() {
                log::error!("escape exchange not allowed by the driver options");
                return Err(IfdError::NotSupported);
            }
            let slot_number = dev.slots[channel.slot_index].index;
            let mut out = Vec::new();
            dev.escape(slot_number, tx, &mut out, None)
                .map_err(map_cmd_error)?;
            out
        } else {
            return Err(IfdError::NotSupported);
        };

        if rx.len() > rx_limit {
            return Err(IfdError::InsufficientBuffer);
        }
        Ok(rx)
    }

    /// Feature TLVs: 6-byte records with a big-endian control code.
    fn feature_list(&self, dev: &Device) -> Vec<u8> {
        use control_codes::*;

        let mut out = Vec::new();
        let mut push = |tag: u8, code: u32| {
            out.push(tag);
            out.push(4);
            out.extend_from_slice(&code.to_be_bytes());
        };

        if dev.desc.pin_support & crate::descriptor::PIN_SUPPORT_VERIFY != 0 {
            push(
                FEATURE_VERIFY_PIN_DIRECT,
                feature_ioctl(FEATURE_VERIFY_PIN_DIRECT),
            );
        }
        if dev.desc.pin_support & crate::descriptor::PIN_SUPPORT_MODIFY != 0 {
            push(
                FEATURE_MODIFY_PIN_DIRECT,
                feature_ioctl(FEATURE_MODIFY_PIN_DIRECT),
            );
        }
        if dev.desc.pin_support != 0 {
            push(
                FEATURE_IFD_PIN_PROPERTIES,
                feature_ioctl(FEATURE_IFD_PIN_PROPERTIES),
            );
        }
        if self.config.allow_escape_exchange() {
            push(
                FEATURE_CCID_ESC_COMMAND,
                IOCTL_SMARTCARD_VENDOR_IFD_EXCHANGE,
            );
        }
        push(
            FEATURE_GET_TLV_PROPERTIES,
            feature_ioctl(FEATURE_GET_TLV_PROPERTIES),
        );
        out
    }

    /// Reader property TLVs (mixed endianness per part 10: values are
    /// little-endian here, unlike the feature list).
    fn property_tlvs(&self, dev: &Device) -> Vec<u8> {
        use control_codes::*;

        let mut out = Vec::new();

        out.push(PROPERTY_wLcdLayout);
        out.push(2);
        out.extend_from_slice(&dev.desc.lcd_layout.to_le_bytes());

        out.push(PROPERTY_wIdVendor);
        out.push(2);
        out.extend_from_slice(&dev.desc.vendor_id.to_le_bytes());

        out.push(PROPERTY_wIdProduct);
        out.push(2);
        out.extend_from_slice(&dev.desc.product_id.to_le_bytes());

        let max_apdu: u32 = match dev.desc.exchange_class() {
            ExchangeClass::ExtendedApdu => 0x1_0000,
            _ => dev.desc.max_block_payload() as u32,
        };
        out.push(PROPERTY_dwMaxAPDUDataSize);
        out.push(4);
        out.extend_from_slice(&max_apdu.to_le_bytes());

        out.push(PROPERTY_bPPDUSupport);
        out.push(1);
        out.push(0);

        if let Some(features) = &dev.desc.firmware_features {
            out.push(PROPERTY_bEntryValidationCondition);
            out.push(1);
            out.push(features.entry_validation_condition);

            if features.min_pin_size > 0 {
                out.push(PROPERTY_bMinPINSize);
                out.push(1);
                out.push(features.min_pin_size);
            }
            if features.max_pin_size > 0 {
                out.push(PROPERTY_bMaxPINSize);
                out.push(1);
                out.push(features.max_pin_size);
            }
            out.push(PROPERTY_bTimeOut2);
            out.push(1);
            out.push(0);
        } else if dev.desc.pin_support != 0 {
            out.push(PROPERTY_bEntryValidationCondition);
            out.push(1);
            out.push(0x07);
        }

        out
    }

    /// Attribute getter.
    pub fn get_capabilities(&self, handle: u32, tag: u32) -> IfdResult<Vec<u8>> {
        use tags::*;

        let channel = self.channel(handle)?;
        let mut dev = channel.device.lock().unwrap();
        let dev = &mut *dev;

        match tag {
            TAG_IFD_ATR | SCARD_ATTR_ATR_STRING => Ok(dev.slots[channel.slot_index].atr.clone()),
            SCARD_ATTR_ICC_PRESENCE => {
                let slot_number = dev.slots[channel.slot_index].index;
                let status = dev.slot_status(slot_number).map_err(map_cmd_error)?;
                Ok(vec![if status == crate::ccid::ICC_ABSENT { 0 } else { 2 }])
            }
            SCARD_ATTR_ICC_INTERFACE_STATUS => {
                let slot_number = dev.slots[channel.slot_index].index;
                let status = dev.slot_status(slot_number).map_err(map_cmd_error)?;
                Ok(vec![u8::from(status == crate::ccid::ICC_PRESENT_ACTIVE)])
            }
            TAG_IFD_SIMULTANEOUS_ACCESS => Ok(vec![MAX_READERS as u8]),
            TAG_IFD_THREAD_SAFE => Ok(vec![1]),
            TAG_IFD_SLOT_THREAD_SAFE => Ok(vec![0]),
            TAG_IFD_SLOTS_NUMBER => Ok(vec![dev.desc.max_slot_index + 1]),
            SCARD_ATTR_VENDOR_NAME => Ok(dev
                .desc
                .manufacturer
                .clone()
                .unwrap_or_default()
                .into_bytes()),
            SCARD_ATTR_VENDOR_IFD_SERIAL_NO => Ok(dev
                .desc
                .serial_number
                .clone()
                .unwrap_or_default()
                .into_bytes()),
            SCARD_ATTR_VENDOR_IFD_VERSION => {
                // IFD version as MMmmbbbb.
                Ok((u32::from(dev.desc.bcd_device) << 16).to_be_bytes().to_vec())
            }
            SCARD_ATTR_MAXINPUT => {
                let max: u32 = match dev.desc.exchange_class() {
                    ExchangeClass::ExtendedApdu => 0x1_0000,
                    _ => dev.desc.max_block_payload() as u32,
                };
                Ok(max.to_le_bytes().to_vec())
            }
            _ => Err(IfdError::NotSupported),
        }
    }

    /// Attribute setter. No attribute is settable on this driver.
    pub fn set_capabilities(&self, handle: u32, _tag: u32, _value: &[u8]) -> IfdResult<()> {
        let _ = self.channel(handle)?;
        Err(IfdError::NotSupported)
    }

    /// Low-frequency card presence probe.
    pub fn icc_presence(&self, handle: u32) -> IfdResult<bool> {
        let channel = self.channel(handle)?;
        let mut dev = channel.device.lock().unwrap();
        let dev = &mut *dev;

        if dev.desc.forced_absent {
            return Ok(false);
        }

        let slot_number = dev.slots[channel.slot_index].index;
        let status = dev.slot_status(slot_number).map_err(map_cmd_error)?;
        Ok(status != crate::ccid::ICC_ABSENT)
    }
}

fn map_port_error(e: PortError) -> IfdError {
    match e {
        PortError::NoSuchDevice => IfdError::NoSuchDevice,
        PortError::Timeout => IfdError::ResponseTimeout,
        _ => IfdError::Communication,
    }
}

fn map_cmd_error(e: CmdError) -> IfdError {
    match e {
        CmdError::Port(p) => map_port_error(p),
        CmdError::Slot(crate::ccid::SlotError::CardAbsent) => IfdError::IccNotPresent,
        CmdError::NotSupported | CmdError::UnsupportedCase => IfdError::NotSupported,
        CmdError::ResponseTimeout => IfdError::ResponseTimeout,
        CmdError::T1(crate::t1::T1Error::Parity) => IfdError::Parity,
        CmdError::T1(crate::t1::T1Error::Overrun) => IfdError::InsufficientBuffer,
        _ => IfdError::Communication,
    }
}

/// Baud rate for the F and D in effect: `f x D/F` at the reader's clock.
fn baud_rate(desc: &ReaderDescriptor, f: u32, d: u32) -> u32 {
    if f == 0 || d == 0 {
        // Non ISO encodings fall back to the TA1=11 values.
        return baud_rate(desc, 372, 1);
    }
    ((1000 * u64::from(desc.default_clock) * u64::from(d)) / u64::from(f)) as u32
}

/// Compatibility patch for cards that are not strict about the extra guard
/// time: when TA1 asks for a fast baud rate and the EGT is 0 or 255, force
/// TC1 to 2 (for T=0, or T=1 with CWI >= 2).
fn extra_egt(atr: &mut Atr, desc: &ReaderDescriptor, protocol: CardProtocol) {
    if atr.interface_byte(1, crate::atr::InterfaceByte::Ta).is_none() {
        return;
    }

    let f = atr.f();
    let d = atr.d();
    if f == 0 || d == 0 {
        return;
    }

    let card_baud = baud_rate(desc, f, d);
    let default_baud = baud_rate(desc, 372, 1);
    if card_baud <= default_baud {
        return;
    }

    match atr.tc1() {
        Some(0x00) | Some(0xFF) => {}
        _ => return,
    }

    match protocol {
        CardProtocol::T0 => {
            atr.set_tc1(2);
            log::info!("extra EGT patch applied");
        }
        CardProtocol::T1 => {
            if let Some((_, cwi)) = atr.bwi_cwi() {
                if cwi >= 2 {
                    atr.set_tc1(2);
                    log::info!("extra EGT patch applied");
                }
            }
        }
    }
}

/// T=0 exchange timeout from the card parameters; clock in kHz so the
/// result is in milliseconds.
fn t0_card_timeout(f: f64, d: f64, tc1: u8, tc2: u8, clock_khz: u32) -> Duration {
    if f == 0.0 || d == 0.0 || clock_khz == 0 {
        return Duration::from_secs(60);
    }
    let clock = f64::from(clock_khz);

    // Extra guard time between characters we emit.
    let egt = 12.0 * f / d / clock + (f / d) * f64::from(tc1) / clock;
    // Work waiting time of the card.
    let wwt = 960.0 * f64::from(tc2) * f / clock;

    // ISO-IN: 5 byte header, procedure byte, 256 data bytes out, SW.
    let iso_in = 261.0 * egt + (3.0 + 3.0) * wwt;
    // ISO-OUT: 5 byte header, procedure byte plus 256 data bytes plus SW
    // back.
    let iso_out = 5.0 * egt + (1.0 + 259.0) * wwt;

    let ms = iso_in.max(iso_out).max(3000.0);
    Duration::from_millis(ms as u64)
}

/// T=1 exchange timeout: a full 260-byte block out, BWT, a full block back.
fn t1_card_timeout(f: f64, d: f64, tc1: u8, bwi: u8, cwi: u8, clock_khz: u32) -> Duration {
    if f == 0.0 || d == 0.0 || clock_khz == 0 {
        return Duration::from_secs(60);
    }
    let clock = f64::from(clock_khz);

    let etu = f / d / clock;
    let egt = 12.0 * etu + (f / d) * f64::from(tc1) / clock;
    let bwt = 11.0 * etu + f64::from(1u32 << bwi) * 960.0 * 372.0 / clock;
    let cwt = (11.0 + f64::from(1u32 << cwi)) * etu;

    // One second on top so the reader's own timeout fires first and its
    // error reaches us.
    let ms = 260.0 * egt + bwt + 260.0 * cwt + 1000.0;
    Duration::from_millis(ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_parameters_default_to_a_minute() {
        assert_eq!(t0_card_timeout(0.0, 1.0, 0, 10, 4000), Duration::from_secs(60));
        assert_eq!(t1_card_timeout(372.0, 0.0, 0, 4, 5, 4000), Duration::from_secs(60));
        assert_eq!(t0_card_timeout(372.0, 1.0, 0, 10, 0), Duration::from_secs(60));
    }

    #[test]
    fn t0_timeout_grows_with_wwt() {
        let slow = t0_card_timeout(372.0, 1.0, 0, 20, 4000);
        let fast = t0_card_timeout(372.0, 1.0, 0, 10, 4000);
        assert!(slow > fast);
        // Never below the floor.
        assert!(fast >= Duration::from_secs(3));
    }

    #[test]
    fn t1_timeout_includes_safety_margin() {
        let timeout = t1_card_timeout(372.0, 1.0, 0, 4, 5, 4000);
        assert!(timeout >= Duration::from_secs(1));
        // BWI dominates.
        let long = t1_card_timeout(372.0, 1.0, 0, 9, 5, 4000);
        assert!(long > timeout);
    }

    #[test]
    fn extra_egt_applies_to_fast_t0_cards() {
        // TA1 = 0x96 (fast), TC1 = 0xFF.
        let raw = [0x3B, 0x50, 0x96, 0xFF];
        let mut atr = Atr::parse(&raw).unwrap();
        let desc = ReaderDescriptor::default();

        extra_egt(&mut atr, &desc, CardProtocol::T0);
        assert_eq!(atr.tc1(), Some(2));
    }

    #[test]
    fn extra_egt_leaves_default_speed_cards_alone() {
        let raw = [0x3B, 0x50, 0x11, 0x00];
        let mut atr = Atr::parse(&raw).unwrap();
        let desc = ReaderDescriptor::default();

        extra_egt(&mut atr, &desc, CardProtocol::T0);
        assert_eq!(atr.tc1(), Some(0));
    }

    #[test]
    fn baud_rate_computation() {
        let desc = ReaderDescriptor::default(); // 4000 kHz clock
        assert_eq!(baud_rate(&desc, 372, 1), 10752);
        assert_eq!(baud_rate(&desc, 512, 32), 250_000);
    }

    #[test]
    fn unknown_handle_is_reported() {
        let driver = Driver::default();
        assert!(matches!(
            driver.transmit(42, &[0x00], 256),
            Err(IfdError::UnknownHandle)
        ));
        assert!(matches!(
            driver.close_channel(42),
            Err(IfdError::UnknownHandle)
        ));
    }
}
