//! Per-reader workarounds.
//!
//! Identification is `(vendorId << 16) | productId`, sometimes refined by
//! `bcdDevice`. Pre-open hooks run before the first card exchange and only
//! touch the descriptor; post-open hooks may talk to the reader through
//! vendor escapes. The facade applies both around the open sequence; tests
//! can exercise hooks directly against a scripted device.

use std::time::Duration;

use crate::ccid::Voltage;
use crate::commands::{CmdError, Device};
use crate::config::Config;
use crate::descriptor::{
    ExchangeClass, FirmwareFeatures, FramingClass, DEFAULT_READ_TIMEOUT, FEATURE_EXCHANGE_MASK,
    FEATURE_EXTENDED_APDU, FEATURE_SHORT_APDU,
};

pub const GEMPC433: u32 = 0x08E6_4433;
pub const GEMPCKEY: u32 = 0x08E6_3438;
pub const GEMPCTWIN: u32 = 0x08E6_3437;
pub const GEMPCPINPAD: u32 = 0x08E6_3478;
pub const GEMCORESIMPRO: u32 = 0x08E6_3480;
pub const GEMCORESIMPRO2: u32 = 0x08E6_0000;
pub const GEMCOREPOSPRO: u32 = 0x08E6_3479;
pub const CARDMAN3121: u32 = 0x076B_3021;
pub const SCR331DI: u32 = 0x04E6_5111;
pub const SEC1210: u32 = 0x0424_1202;
pub const CHERRYXX33: u32 = 0x046A_0005;
pub const CHERRYST2000: u32 = 0x046A_003E;
pub const OZ776: u32 = 0x0B97_7762;
pub const OZ776_7772: u32 = 0x0B97_7772;
pub const SPR532: u32 = 0x04E6_E003;
pub const MYSMARTPAD: u32 = 0x09BE_0002;
pub const CHERRYXX44: u32 = 0x046A_0010;
pub const CL1356D: u32 = 0x0B81_0200;
pub const DELLSCRK: u32 = 0x413C_2101;
pub const DELLSK: u32 = 0x413C_2100;
pub const VEGAALPHA: u32 = 0x0982_0008;
pub const HPSMARTCARDKEYBOARD: u32 = 0x03F0_1024;
pub const HP_CCIDSMARTCARDKEYBOARD: u32 = 0x03F0_0036;
pub const KOBIL_IDTOKEN: u32 = 0x0D46_301D;
pub const FUJITSUSMARTKEYB: u32 = 0x0BF8_1017;
pub const C3PO_LTC31_V2: u32 = 0x0783_0006;
pub const HID_AVIATOR: u32 = 0x076B_3A21;
pub const HID_OMNIKEY_3X21: u32 = 0x076B_3031;
pub const HID_OMNIKEY_6121: u32 = 0x076B_6632;
pub const CHERRY_XX44: u32 = 0x046A_00A7;
pub const FUJITSU_D323: u32 = 0x0BF8_1024;
pub const CHERRY_KC1000SC: u32 = 0x046A_00A1;
pub const ELATEC_TWN4_CCID_CDC: u32 = 0x09D8_0427;
pub const ELATEC_TWN4_CCID: u32 = 0x09D8_0428;
pub const SCM_SCL011: u32 = 0x04E6_5293;

pub const VENDOR_GEMALTO: u16 = 0x08E6;

type Hook = fn(&mut Device, &Config) -> Result<(), CmdError>;

/// One quirk record: a reader id and the hooks it needs.
pub struct Quirk {
    pub reader_id: u32,
    pub pre_open: Option<Hook>,
    pub post_open: Option<Hook>,
}

/// The quirk table. Linear scan; the list is short and open happens once.
pub static QUIRKS: &[Quirk] = &[
    Quirk {
        reader_id: MYSMARTPAD,
        pre_open: Some(force_max_ifsd),
        post_open: None,
    },
    Quirk {
        reader_id: CL1356D,
        pre_open: Some(slow_firmware_boot),
        post_open: None,
    },
    Quirk {
        reader_id: GEMPCTWIN,
        pre_open: Some(zlp_fixup),
        post_open: Some(twin_key_apdu_mode),
    },
    Quirk {
        reader_id: GEMPCKEY,
        pre_open: Some(zlp_fixup),
        post_open: Some(twin_key_apdu_mode),
    },
    Quirk {
        reader_id: DELLSCRK,
        pre_open: Some(zlp_fixup),
        post_open: None,
    },
    Quirk {
        reader_id: OZ776,
        pre_open: Some(oz776_limits),
        post_open: None,
    },
    Quirk {
        reader_id: OZ776_7772,
        pre_open: Some(oz776_limits),
        post_open: None,
    },
    Quirk {
        reader_id: ELATEC_TWN4_CCID_CDC,
        pre_open: Some(slow_status_timeout),
        post_open: Some(restore_default_timeout),
    },
    Quirk {
        reader_id: ELATEC_TWN4_CCID,
        pre_open: Some(slow_status_timeout),
        post_open: Some(restore_default_timeout),
    },
    Quirk {
        reader_id: SCM_SCL011,
        pre_open: Some(slow_answer_timeout),
        post_open: Some(restore_default_timeout),
    },
    Quirk {
        reader_id: GEMPCPINPAD,
        pre_open: None,
        post_open: Some(pinpad_setup),
    },
    Quirk {
        reader_id: VEGAALPHA,
        pre_open: None,
        post_open: Some(pinpad_setup),
    },
    Quirk {
        reader_id: HPSMARTCARDKEYBOARD,
        pre_open: None,
        post_open: Some(disable_insecure_pinpad),
    },
    Quirk {
        reader_id: HP_CCIDSMARTCARDKEYBOARD,
        pre_open: None,
        post_open: Some(disable_insecure_pinpad),
    },
    Quirk {
        reader_id: FUJITSUSMARTKEYB,
        pre_open: None,
        post_open: Some(disable_insecure_pinpad),
    },
    Quirk {
        reader_id: C3PO_LTC31_V2,
        pre_open: None,
        post_open: Some(disable_insecure_pinpad),
    },
    Quirk {
        reader_id: HID_AVIATOR,
        pre_open: None,
        post_open: Some(phantom_pinpad_chaining),
    },
    Quirk {
        reader_id: HID_OMNIKEY_3X21,
        pre_open: None,
        post_open: Some(phantom_pinpad_chaining),
    },
    Quirk {
        reader_id: HID_OMNIKEY_6121,
        pre_open: None,
        post_open: Some(phantom_pinpad_chaining),
    },
    Quirk {
        reader_id: CHERRY_XX44,
        pre_open: None,
        post_open: Some(phantom_pinpad_chaining),
    },
    Quirk {
        reader_id: FUJITSU_D323,
        pre_open: None,
        post_open: Some(phantom_pinpad_chaining),
    },
    Quirk {
        reader_id: CHERRY_KC1000SC,
        pre_open: None,
        post_open: Some(kc1000sc_firmware_chaining),
    },
];

fn force_max_ifsd(dev: &mut Device, _config: &Config) -> Result<(), CmdError> {
    dev.desc.max_ifsd = 254;
    Ok(())
}

fn slow_firmware_boot(dev: &mut Device, _config: &Config) -> Result<(), CmdError> {
    // The firmware needs some time to initialize.
    std::thread::sleep(Duration::from_secs(1));
    dev.desc.read_timeout = Duration::from_secs(60);
    Ok(())
}

fn slow_answer_timeout(dev: &mut Device, _config: &Config) -> Result<(), CmdError> {
    // This reader needs 350 ms to answer.
    dev.desc.read_timeout = DEFAULT_READ_TIMEOUT * 4;
    Ok(())
}

fn kc1000sc_firmware_chaining(dev: &mut Device, _config: &Config) -> Result<(), CmdError> {
    // Firmware 1.00 answers case 2 T=1 APDUs with extended APDU style
    // chaining even though it declares short APDU.
    if dev.desc.bcd_device == 0x0100 && dev.desc.exchange_class() == ExchangeClass::ShortApdu {
        dev.desc.features &= !FEATURE_EXCHANGE_MASK;
        dev.desc.features |= FEATURE_EXTENDED_APDU;
    }
    Ok(())
}

fn zlp_fixup(dev: &mut Device, _config: &Config) -> Result<(), CmdError> {
    // Only the chipset with firmware 2.00 emits zero byte packets when
    // plugged into a USB 3 port.
    if dev.desc.bcd_device == 0x0200 {
        log::info!("ZLP fixup");
        dev.desc.zero_length_packet = true;
    }
    Ok(())
}

fn oz776_limits(dev: &mut Device, _config: &Config) -> Result<(), CmdError> {
    dev.desc.max_data_rate = 9600;
    // The receive path must avoid bulk-in transfers of exactly a packet
    // multiple on this chipset.
    dev.desc.split_modulo_64_reads = true;
    Ok(())
}

fn slow_status_timeout(dev: &mut Device, _config: &Config) -> Result<(), CmdError> {
    // The reader answers the first slot status after up to one second when
    // no tag is present.
    dev.desc.read_timeout = DEFAULT_READ_TIMEOUT * 10;
    Ok(())
}

fn restore_default_timeout(dev: &mut Device, _config: &Config) -> Result<(), CmdError> {
    dev.desc.read_timeout = DEFAULT_READ_TIMEOUT;
    Ok(())
}

/// The GemPC Twin and Key announce TPDU but can run short APDU; switching
/// is opt-in through the driver options.
fn twin_key_apdu_mode(dev: &mut Device, config: &Config) -> Result<(), CmdError> {
    if !config.twin_key_apdu() {
        return Ok(());
    }
    let mut res = Vec::new();
    if dev.escape(0, &[0x1F, 0x02], &mut res, None).is_ok() {
        dev.desc.features &= !FEATURE_EXCHANGE_MASK;
        dev.desc.features |= FEATURE_SHORT_APDU;
    }
    Ok(())
}

fn disable_insecure_pinpad(dev: &mut Device, _config: &Config) -> Result<(), CmdError> {
    // The PIN entered on the pad is also sent to the host in clear.
    log::info!("disabling the insecure pinpad of {:08X}", dev.desc.reader_id());
    dev.desc.pin_support = 0;
    Ok(())
}

fn phantom_pinpad_chaining(dev: &mut Device, _config: &Config) -> Result<(), CmdError> {
    // The chip advertises a pinpad it does not have, and its firmware uses
    // extended APDU chaining.
    dev.desc.pin_support = 0;
    dev.desc.features &= !FEATURE_EXCHANGE_MASK;
    dev.desc.features |= FEATURE_EXTENDED_APDU;
    Ok(())
}

/// Messages shown by the GemPC Pinpad, per language.
const PINPAD_STRING_SIZE: usize = 16;
const PINPAD_MESSAGES: &[(&str, [&str; 10])] = &[
    (
        "fr",
        [
            "Entrer PIN",
            "Nouveau PIN",
            "Confirmer PIN",
            "PIN correct",
            "PIN Incorrect !",
            "Delai depasse",
            "* essai restant",
            "Inserer carte",
            "Erreur carte",
            "PIN bloque",
        ],
    ),
    (
        "de",
        [
            "PIN eingeben",
            "Neue PIN",
            "PIN bestatigen",
            "PIN korrect",
            "Falsche PIN !",
            "Zeit abgelaufen",
            "* Versuche ubrig",
            "Karte einstecken",
            "Fehler Karte",
            "PIN blockiert",
        ],
    ),
    (
        "es",
        [
            "Introducir PIN",
            "Nuevo PIN",
            "Confirmar PIN",
            "PIN OK",
            "PIN Incorrecto !",
            "Tiempo Agotado",
            "* ensayos quedan",
            "Introducir Tarj.",
            "Error en Tarjeta",
            "PIN bloqueado",
        ],
    ),
    (
        "it",
        [
            "Inserire PIN",
            "Nuovo PIN",
            "Confermare PIN",
            "PIN Corretto",
            "PIN Errato !",
            "Tempo scaduto",
            "* prove rimaste",
            "Inserire Carta",
            "Errore Carta",
            "PIN ostruito",
        ],
    ),
    (
        "pt",
        [
            "Insira PIN",
            "Novo PIN",
            "Conf. novo PIN",
            "PIN OK",
            "PIN falhou!",
            "Tempo expirou",
            "* tentiv. restam",
            "Introduza cartao",
            "Erro cartao",
            "PIN bloqueado",
        ],
    ),
    (
        "nl",
        [
            "Inbrengen code",
            "Nieuwe code",
            "Bevestig code",
            "Code aanvaard",
            "Foute code",
            "Time out",
            "* Nog Pogingen",
            "Kaart inbrengen",
            "Kaart fout",
            "Kaart blok",
        ],
    ),
    (
        "tr",
        [
            "PIN Giriniz",
            "Yeni PIN",
            "PIN Onayala",
            "PIN OK",
            "Yanlis PIN",
            "Zaman Asimi",
            "* deneme kaldi",
            "Karti Takiniz",
            "Kart Hatasi",
            "Kart Kilitli",
        ],
    ),
];

const PINPAD_MESSAGES_EN: [&str; 10] = [
    "Enter PIN",
    "New PIN",
    "Confirm PIN",
    "PIN OK",
    "Incorrect PIN!",
    "Time Out",
    "* retries left",
    "Insert Card",
    "Card Error",
    "PIN blocked",
];

/// Build the escape command that loads the localized pinpad strings.
pub(crate) fn pinpad_strings_command(locale: Option<&str>) -> Vec<u8> {
    let messages = locale
        .and_then(|lang| {
            PINPAD_MESSAGES
                .iter()
                .find(|(prefix, _)| lang.starts_with(prefix))
        })
        .map(|(_, msgs)| msgs)
        .unwrap_or(&PINPAD_MESSAGES_EN);

    let mut cmd = vec![0xB2, 0xA0, 0x00, 0x4D, 0x4C];
    for message in messages {
        let mut bytes = message.as_bytes().to_vec();
        bytes.resize(PINPAD_STRING_SIZE, b' ');
        cmd.extend_from_slice(&bytes);
    }
    cmd
}

/// Load the localized strings into the pinpad memory, and optionally turn
/// the reader-side PIN retry counter off.
fn pinpad_setup(dev: &mut Device, config: &Config) -> Result<(), CmdError> {
    let cmd = pinpad_strings_command(config.locale.as_deref());

    std::thread::sleep(Duration::from_secs(1));
    let mut res = Vec::new();
    match dev.escape(0, &cmd, &mut res, Some(DEFAULT_READ_TIMEOUT)) {
        Ok(()) => log::debug!("l10n strings loaded successfully"),
        Err(e) => log::debug!("failed to load l10n strings: {e}"),
    }

    if config.disable_pin_retries() {
        let mut res = Vec::new();
        match dev.escape(0, &[0xB5, 0x00], &mut res, Some(DEFAULT_READ_TIMEOUT)) {
            Ok(()) => log::debug!("disable SPE retry counter successful"),
            Err(e) => log::error!("failed to disable SPE retry counter: {e}"),
        }
    }

    Ok(())
}

/// Apply the table's pre-open hook plus the generic pre-open steps.
pub fn apply_pre_open(dev: &mut Device, config: &Config) -> Result<(), CmdError> {
    if let Some(hook) = QUIRKS
        .iter()
        .find(|q| q.reader_id == dev.desc.reader_id())
        .and_then(|q| q.pre_open)
    {
        hook(dev, config)?;
    }

    match dev.desc.framing {
        FramingClass::Ccid => {
            // Drain a possible stale notification from the interrupt pipe.
            let _ = dev.port.interrupt_read(Duration::from_millis(100));
        }
        FramingClass::IccdA | FramingClass::IccdB => {
            if dev.desc.framing == FramingClass::IccdB
                && dev.desc.exchange_class() == ExchangeClass::ShortApdu
            {
                // Use the extended APDU algorithm on these devices.
                dev.desc.features &= !FEATURE_EXCHANGE_MASK;
                dev.desc.features |= FEATURE_EXTENDED_APDU;
            }

            // Exercise the state machine once so the first real power-up
            // starts from a known state.
            let _ = dev.power_off(0);
            let _ = dev.power_on(0, Voltage::Automatic);
            let _ = dev.power_off(0);
        }
    }

    Ok(())
}

/// Apply the table's post-open hook plus the generic post-open steps.
pub fn apply_post_open(dev: &mut Device, config: &Config) -> Result<(), CmdError> {
    if let Some(hook) = QUIRKS
        .iter()
        .find(|q| q.reader_id == dev.desc.reader_id())
        .and_then(|q| q.post_open)
    {
        hook(dev, config)?;
    }

    // Gemalto readers may report additional features through an escape.
    if dev.desc.vendor_id == VENDOR_GEMALTO {
        let mut res = Vec::new();
        match dev.escape(0, &[0x6A], &mut res, None) {
            Ok(()) => {
                if let Some(features) = FirmwareFeatures::parse(&res) {
                    log::info!("firmware features: {features:?}");
                    dev.desc.firmware_features = Some(features);
                } else {
                    log::info!("firmware features response has {} bytes", res.len());
                }
            }
            Err(e) => log::info!("firmware features probe failed: {e}"),
        }
    }

    Ok(())
}
