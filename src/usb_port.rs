//! USB back-end: bulk transfers through `rusb`, CCID class descriptor
//! parsing, and device discovery.

use std::time::Duration;

use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, UsbContext};

use crate::commands::WRITE_TIMEOUT;
use crate::descriptor::{FramingClass, ReaderDescriptor, DEFAULT_READ_TIMEOUT};
use crate::transport::{CcidPort, PortError};

/// USB class code for smart card devices.
const USB_CLASS_SMART_CARD: u8 = 0x0B;

/// CCID functional descriptor: type 0x21, 54 bytes.
const CCID_DESCRIPTOR_TYPE: u8 = 0x21;
const CCID_DESCRIPTOR_SIZE: usize = 54;

/// Class-specific GET_DATA_RATES request.
const GET_DATA_RATES: u8 = 0x03;

fn map_usb_error(e: rusb::Error) -> PortError {
    match e {
        rusb::Error::NoDevice => PortError::NoSuchDevice,
        rusb::Error::Timeout => PortError::Timeout,
        other => PortError::Io(other.to_string()),
    }
}

/// A claimed CCID interface with its bulk endpoints.
pub struct UsbPort {
    handle: DeviceHandle<Context>,
    interface: u8,
    endpoint_out: u8,
    endpoint_in: u8,
    endpoint_interrupt: Option<u8>,
    zero_length_packet: bool,
    packet_size: usize,
    name: String,
}

impl CcidPort for UsbPort {
    fn write(&mut self, bytes: &[u8]) -> Result<(), PortError> {
        self.handle
            .write_bulk(self.endpoint_out, bytes, WRITE_TIMEOUT)
            .map_err(map_usb_error)?;

        // Some firmwares stall when a command fills the last packet
        // exactly; close the transfer with a zero length packet.
        if self.zero_length_packet && !bytes.is_empty() && bytes.len() % self.packet_size == 0 {
            self.handle
                .write_bulk(self.endpoint_out, &[], WRITE_TIMEOUT)
                .map_err(map_usb_error)?;
        }

        Ok(())
    }

    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, PortError> {
        let mut buffer = vec![0u8; max_len];
        let n = self
            .handle
            .read_bulk(self.endpoint_in, &mut buffer, timeout)
            .map_err(map_usb_error)?;
        buffer.truncate(n);
        Ok(buffer)
    }

    fn control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        data: &mut [u8],
    ) -> Result<usize, PortError> {
        if request_type & 0x80 != 0 {
            self.handle
                .read_control(
                    request_type,
                    request,
                    value,
                    u16::from(self.interface),
                    data,
                    DEFAULT_READ_TIMEOUT,
                )
                .map_err(map_usb_error)
        } else {
            self.handle
                .write_control(
                    request_type,
                    request,
                    value,
                    u16::from(self.interface),
                    data,
                    WRITE_TIMEOUT,
                )
                .map_err(map_usb_error)
        }
    }

    fn interrupt_read(&mut self, timeout: Duration) -> Result<Vec<u8>, PortError> {
        let endpoint = self.endpoint_interrupt.ok_or(PortError::Unsupported)?;
        let mut buffer = vec![0u8; 8];
        let n = self
            .handle
            .read_interrupt(endpoint, &mut buffer, timeout)
            .map_err(map_usb_error)?;
        buffer.truncate(n);
        Ok(buffer)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_zero_length_packet(&mut self, enabled: bool) {
        self.zero_length_packet = enabled;
    }

    fn reset(&mut self) {
        if let Err(e) = self.handle.reset() {
            log::info!("USB reset failed: {e}");
        }
    }
}

impl Drop for UsbPort {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(self.interface);
    }
}

/// Information about a discovered CCID interface.
#[derive(Debug)]
pub struct CcidDeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub address: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
}

/// List every CCID capable device on the buses.
pub fn list_devices() -> Result<Vec<CcidDeviceInfo>, PortError> {
    let context = Context::new().map_err(map_usb_error)?;
    let mut found = Vec::new();

    for device in context.devices().map_err(map_usb_error)?.iter() {
        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(_) => continue,
        };
        if !is_ccid_device(&device, &desc) {
            continue;
        }

        let (manufacturer, product, serial) = match device.open() {
            Ok(handle) => read_strings(&handle, &desc),
            Err(_) => (None, None, None),
        };

        found.push(CcidDeviceInfo {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            bus_number: device.bus_number(),
            address: device.address(),
            manufacturer,
            product,
            serial,
        });
    }

    Ok(found)
}

/// Open the `index`-th CCID device found on the buses.
pub fn open_by_index(index: usize) -> Result<(UsbPort, ReaderDescriptor), PortError> {
    open_matching(|_, _| true, index)
}

/// Open a device by a `usb:VVVV/PPPP` style device string (an optional
/// suffix after a second `:` is ignored, it carries hotplug information
/// from the resource manager).
pub fn open_by_name(device_string: &str) -> Result<(UsbPort, ReaderDescriptor), PortError> {
    let address = device_string
        .strip_prefix("usb:")
        .ok_or_else(|| PortError::Io(format!("unsupported device string: {device_string}")))?;
    let address = address.split(':').next().unwrap_or(address);
    let (vid, pid) = address
        .split_once('/')
        .ok_or_else(|| PortError::Io(format!("unsupported device string: {device_string}")))?;
    let vid = u16::from_str_radix(vid, 16)
        .map_err(|_| PortError::Io(format!("bad vendor id in {device_string}")))?;
    let pid = u16::from_str_radix(pid, 16)
        .map_err(|_| PortError::Io(format!("bad product id in {device_string}")))?;

    open_matching(move |v, p| v == vid && p == pid, 0)
}

fn open_matching(
    matcher: impl Fn(u16, u16) -> bool,
    skip: usize,
) -> Result<(UsbPort, ReaderDescriptor), PortError> {
    let context = Context::new().map_err(map_usb_error)?;
    let mut seen = 0usize;

    for device in context.devices().map_err(map_usb_error)?.iter() {
        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(_) => continue,
        };
        if !is_ccid_device(&device, &desc) || !matcher(desc.vendor_id(), desc.product_id()) {
            continue;
        }
        if seen < skip {
            seen += 1;
            continue;
        }

        return open_ccid_interface(&device, &desc);
    }

    Err(PortError::NoSuchDevice)
}

fn is_ccid_device(device: &Device<Context>, desc: &DeviceDescriptor) -> bool {
    if desc.class_code() == USB_CLASS_SMART_CARD {
        return true;
    }

    let config = match device.active_config_descriptor() {
        Ok(config) => config,
        Err(_) => return false,
    };
    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            if descriptor.class_code() == USB_CLASS_SMART_CARD {
                return true;
            }
        }
    }
    false
}

fn read_strings(
    handle: &DeviceHandle<Context>,
    desc: &DeviceDescriptor,
) -> (Option<String>, Option<String>, Option<String>) {
    let read = |index: Option<u8>| match index {
        Some(idx) if idx > 0 => handle.read_string_descriptor_ascii(idx).ok(),
        _ => None,
    };
    (
        read(desc.manufacturer_string_index()),
        read(desc.product_string_index()),
        read(desc.serial_number_string_index()),
    )
}

fn open_ccid_interface(
    device: &Device<Context>,
    desc: &DeviceDescriptor,
) -> Result<(UsbPort, ReaderDescriptor), PortError> {
    let handle = device.open().map_err(map_usb_error)?;
    let config = device.active_config_descriptor().map_err(map_usb_error)?;

    for interface in config.interfaces() {
        for ifdesc in interface.descriptors() {
            if ifdesc.class_code() != USB_CLASS_SMART_CARD {
                continue;
            }

            let interface_number = ifdesc.interface_number();

            #[cfg(target_os = "linux")]
            {
                if handle.kernel_driver_active(interface_number).unwrap_or(false) {
                    let _ = handle.detach_kernel_driver(interface_number);
                }
            }
            handle
                .claim_interface(interface_number)
                .map_err(map_usb_error)?;

            let mut endpoint_out = None;
            let mut endpoint_in = None;
            let mut endpoint_interrupt = None;
            let mut packet_size = 64usize;
            let mut endpoint_extra: Vec<u8> = Vec::new();

            for endpoint in ifdesc.endpoint_descriptors() {
                match endpoint.transfer_type() {
                    rusb::TransferType::Bulk => match endpoint.direction() {
                        rusb::Direction::Out => {
                            endpoint_out = Some(endpoint.address());
                            packet_size = usize::from(endpoint.max_packet_size().max(1));
                        }
                        rusb::Direction::In => endpoint_in = Some(endpoint.address()),
                    },
                    rusb::TransferType::Interrupt => {
                        if endpoint.direction() == rusb::Direction::In {
                            endpoint_interrupt = Some(endpoint.address());
                        }
                    }
                    _ => {}
                }
                if let Some(extra) = endpoint.extra() {
                    if !extra.is_empty() {
                        endpoint_extra = extra.to_vec();
                    }
                }
            }

            // The class descriptor normally follows the interface
            // descriptor; one chipset misplaces it after the last
            // endpoint.
            let class_desc = find_class_descriptor(ifdesc.extra())
                .or_else(|| find_class_descriptor(&endpoint_extra))
                .ok_or_else(|| PortError::Io("no CCID class descriptor".into()))?;

            let framing = match ifdesc.protocol_code() {
                1 => FramingClass::IccdA,
                2 => FramingClass::IccdB,
                _ => FramingClass::Ccid,
            };

            let (manufacturer, product, serial) = read_strings(&handle, desc);
            let version = desc.device_version();
            let bcd_device = (u16::from(version.major()) << 8)
                | (u16::from(version.minor()) << 4)
                | u16::from(version.sub_minor());

            let mut reader = ReaderDescriptor {
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                bcd_device,
                manufacturer,
                product,
                serial_number: serial,
                framing,
                features: read_u32(&class_desc, 40),
                max_message_length: read_u32(&class_desc, 44),
                max_ifsd: read_u32(&class_desc, 28),
                default_clock: read_u32(&class_desc, 10),
                max_data_rate: read_u32(&class_desc, 23),
                data_rates: None,
                max_slot_index: class_desc[4],
                card_forced_present: false,
                forced_absent: false,
                voltage_support: class_desc[5],
                pin_support: class_desc[52],
                lcd_layout: u16::from(class_desc[50]) | (u16::from(class_desc[51]) << 8),
                read_timeout: DEFAULT_READ_TIMEOUT,
                card_protocol: None,
                firmware_features: None,
                zero_length_packet: false,
                split_modulo_64_reads: false,
            };

            let (endpoint_out, endpoint_in) = match (endpoint_out, endpoint_in) {
                (Some(out), Some(inp)) => (out, inp),
                // The ICCD variants run on control transfers only.
                _ if framing != FramingClass::Ccid => (0, 0),
                _ => return Err(PortError::Io("CCID bulk endpoints not found".into())),
            };

            let name = format!(
                "{:04X}:{:04X} bus {} addr {}",
                desc.vendor_id(),
                desc.product_id(),
                device.bus_number(),
                device.address()
            );
            log::info!(
                "opened {name} on interface {interface_number} (out=0x{endpoint_out:02X}, in=0x{endpoint_in:02X})"
            );

            let mut port = UsbPort {
                handle,
                interface: interface_number,
                endpoint_out,
                endpoint_in,
                endpoint_interrupt,
                zero_length_packet: false,
                packet_size,
                name,
            };

            // Fetch the supported data rate list when the reader declares
            // one.
            let rate_count = usize::from(class_desc[27]);
            if rate_count > 0 {
                reader.data_rates = read_data_rates(&mut port, rate_count);
            }

            return Ok((port, reader));
        }
    }

    Err(PortError::Io("no CCID interface found".into()))
}

/// Walk the class-specific extra bytes for the 0x36/0x21 descriptor.
fn find_class_descriptor(extra: &[u8]) -> Option<Vec<u8>> {
    let mut offset = 0;
    while offset + 1 < extra.len() {
        let length = usize::from(extra[offset]);
        if length < 2 || offset + length > extra.len() {
            return None;
        }
        if extra[offset + 1] == CCID_DESCRIPTOR_TYPE && length == CCID_DESCRIPTOR_SIZE {
            return Some(extra[offset..offset + length].to_vec());
        }
        offset += length;
    }
    None
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_data_rates(port: &mut UsbPort, count: usize) -> Option<Vec<u32>> {
    let mut buffer = vec![0u8; count * 4];
    let n = port.control(0xA1, GET_DATA_RATES, 0, &mut buffer).ok()?;
    if n % 4 != 0 || n == 0 {
        log::info!("GET_DATA_RATES returned {n} bytes");
        return None;
    }
    buffer.truncate(n);
    let rates = buffer.chunks_exact(4).map(|c| read_u32(c, 0)).collect();
    log::debug!("data rates: {rates:?}");
    Some(rates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_descriptor_walk() {
        // A vendor descriptor first, then the CCID one.
        let mut extra = vec![0x03, 0xFF, 0x00];
        let mut ccid = vec![0u8; CCID_DESCRIPTOR_SIZE];
        ccid[0] = CCID_DESCRIPTOR_SIZE as u8;
        ccid[1] = CCID_DESCRIPTOR_TYPE;
        ccid[4] = 1; // bMaxSlotIndex
        extra.extend_from_slice(&ccid);

        let found = find_class_descriptor(&extra).unwrap();
        assert_eq!(found.len(), CCID_DESCRIPTOR_SIZE);
        assert_eq!(found[4], 1);

        assert!(find_class_descriptor(&[0x03, 0xFF]).is_none());
        assert!(find_class_descriptor(&[]).is_none());
    }

    #[test]
    fn device_string_parse_errors() {
        assert!(matches!(open_by_name("bogus"), Err(PortError::Io(_))));
        assert!(matches!(open_by_name("usb:xxxx/yyyy"), Err(PortError::Io(_))));
    }
}
