//! German health insurance card (eGK) reader.
//!
//! Works on any [`CardBackend`] holding a processor card: the ATR comes
//! from a Request ICC, identity files are read from the eGK root and the
//! personal (EF.PD) and insurance (EF.VD) data are gzip-compressed XML
//! documents in DF.HCA.
//!
//! Only the ATR is mandatory. Every other file is read best-effort and
//! simply leaves its keys out of the record when it fails.

pub mod apdu;
pub mod inflate;
pub mod record;
pub mod xml;

use tracing::{debug, info, instrument};

use crate::backend::CardBackend;
use crate::error::{Error, Result};

pub use apdu::{ReadMode, command, read_file};
pub use inflate::{InflateError, inflate_checked};
pub use record::HealthCardRecord;
pub use xml::extract;

/// EF.PD: personal data of the insurant.
pub const EF_PD_SHORT_ID: u8 = 1;
pub const EF_PD_CAPACITY: usize = 0x352;
/// EF.VD: general insurance data.
pub const EF_VD_SHORT_ID: u8 = 2;
pub const EF_VD_CAPACITY: usize = 0x4E2;

/// Bytes of tag and length in front of the EF.GDO card number.
const GDO_HEADER_LEN: usize = 2;
/// Identity files shorter than this are treated as unreadable.
const IDENTITY_MIN_LEN: usize = 3;

const PD: &str = "UC_PersoenlicheVersichertendatenXML";
const VD: &str = "UC_AllgemeineVersicherungsdatenXML";

type Fields = &'static [(&'static str, &'static [&'static str])];

const PD_FIELDS: Fields = &[
    ("insurant.person.firstName", &[PD, "Versicherter", "Person", "Vorname"]),
    ("insurant.person.lastName", &[PD, "Versicherter", "Person", "Nachname"]),
    ("insurant.person.namePrefix", &[PD, "Versicherter", "Person", "Vorsatzwort"]),
    ("insurant.person.nameAffix", &[PD, "Versicherter", "Person", "Namenszusatz"]),
    ("insurant.person.title", &[PD, "Versicherter", "Person", "Titel"]),
    ("insurant.person.dateOfBirth", &[PD, "Versicherter", "Person", "Geburtsdatum"]),
    ("insurant.person.gender", &[PD, "Versicherter", "Person", "Geschlecht"]),
    (
        "insurant.person.zipCode",
        &[PD, "Versicherter", "Person", "StrassenAdresse", "Postleitzahl"],
    ),
    ("insurant.person.city", &[PD, "Versicherter", "Person", "StrassenAdresse", "Ort"]),
    (
        "insurant.person.country",
        &[PD, "Versicherter", "Person", "StrassenAdresse", "Land", "Wohnsitzlaendercode"],
    ),
    (
        "insurant.person.street",
        &[PD, "Versicherter", "Person", "StrassenAdresse", "Strasse"],
    ),
    (
        "insurant.person.streetNumber",
        &[PD, "Versicherter", "Person", "StrassenAdresse", "Hausnummer"],
    ),
    (
        "insurant.person.poZipCode",
        &[PD, "Versicherter", "Person", "PostfachAdresse", "Postleitzahl"],
    ),
    ("insurant.person.poCity", &[PD, "Versicherter", "Person", "PostfachAdresse", "Ort"]),
    (
        "insurant.person.poBox",
        &[PD, "Versicherter", "Person", "PostfachAdresse", "Postfach"],
    ),
    (
        "insurant.person.poCountry",
        &[PD, "Versicherter", "Person", "PostfachAdresse", "Land"],
    ),
    (
        "insurant.person.addressAffix",
        &[PD, "Versicherter", "Person", "StrassenAdresse", "Anschriftenzusatz"],
    ),
    ("insurant.insuranceId", &[PD, "Versicherter", "Versicherten_ID"]),
];

const VD_FIELDS: Fields = &[
    (
        "insurer.id",
        &[VD, "Versicherter", "Versicherungsschutz", "Kostentraeger", "Kostentraegerkennung"],
    ),
    (
        "insurer.country",
        &[VD, "Versicherter", "Versicherungsschutz", "Kostentraeger", "Kostentraegerlaendercode"],
    ),
    (
        "insurer.name",
        &[VD, "Versicherter", "Versicherungsschutz", "Kostentraeger", "Name"],
    ),
    (
        "insurer.billing.id",
        &[
            VD,
            "Versicherter",
            "Versicherungsschutz",
            "Kostentraeger",
            "AbrechnenderKostentraeger",
            "Kostentraegerkennung",
        ],
    ),
    (
        "insurer.billing.country",
        &[
            VD,
            "Versicherter",
            "Versicherungsschutz",
            "Kostentraeger",
            "AbrechnenderKostentraeger",
            "Kostentraegerlaendercode",
        ],
    ),
    (
        "insurer.billing.name",
        &[
            VD,
            "Versicherter",
            "Versicherungsschutz",
            "Kostentraeger",
            "AbrechnenderKostentraeger",
            "Name",
        ],
    ),
];

/// Read everything the card offers into a fresh record.
///
/// Fails with [`Error::InvalidArgument`] for anything but a T=0/T=1 card
/// and with [`Error::NoData`] when not even the ATR can be obtained.
#[instrument(level = "info", skip_all)]
pub fn read_info(card: &dyn CardBackend) -> Result<HealthCardRecord> {
    let card_type = card.card_type()?;
    if !card_type.is_iso() {
        debug!(%card_type, "Card type cannot hold eGK data");
        return Err(Error::InvalidArgument);
    }

    let mut record = HealthCardRecord::new();
    read_atr(card, &mut record).map_err(|e| {
        debug!(error = %e, "Request ICC failed");
        Error::NoData
    })?;

    best_effort("EF.GDO", read_ef_gdo(card, &mut record));
    best_effort("EF.ATR", read_ef_atr(card, &mut record));
    let pd = XmlFile {
        short_id: EF_PD_SHORT_ID,
        mode: ReadMode::LengthPrefixed,
        capacity: EF_PD_CAPACITY,
        fields: PD_FIELDS,
    };
    best_effort("EF.PD", pd.read(card, &mut record));
    let vd = XmlFile {
        short_id: EF_VD_SHORT_ID,
        mode: ReadMode::OffsetPrefixed,
        capacity: EF_VD_CAPACITY,
        fields: VD_FIELDS,
    };
    best_effort("EF.VD", vd.read(card, &mut record));

    info!(fields = record.len(), "Card data read");
    Ok(record)
}

fn best_effort(file: &str, result: Result<()>) {
    if let Err(e) = result {
        debug!(file, error = %e, "Skipping file");
    }
}

fn read_atr(card: &dyn CardBackend, record: &mut HealthCardRecord) -> Result<()> {
    let atr = command(card, &apdu::REQUEST_ICC)?;
    record.insert("atr", Some(hex::encode_upper(atr)));
    Ok(())
}

/// Card number from EF.GDO, after its tag and length.
fn read_ef_gdo(card: &dyn CardBackend, record: &mut HealthCardRecord) -> Result<()> {
    command(card, &apdu::SELECT_EGK_ROOT)?;
    let gdo = command(card, &apdu::READ_EF_GDO)?;
    if gdo.len() < IDENTITY_MIN_LEN {
        return Err(Error::Protocol);
    }
    record.insert("card.id", Some(hex::encode_upper(&gdo[GDO_HEADER_LEN..])));
    Ok(())
}

fn read_ef_atr(card: &dyn CardBackend, record: &mut HealthCardRecord) -> Result<()> {
    command(card, &apdu::SELECT_EGK_ROOT)?;
    let atr = command(card, &apdu::READ_EF_ATR)?;
    if atr.len() < IDENTITY_MIN_LEN {
        return Err(Error::Protocol);
    }
    record.insert("card.atr", Some(hex::encode_upper(atr)));
    Ok(())
}

/// Compressed XML document in DF.HCA and the keys taken from it.
struct XmlFile {
    short_id: u8,
    mode: ReadMode,
    capacity: usize,
    fields: Fields,
}

impl XmlFile {
    /// Once the document parses, every key of the file is inserted.
    fn read(&self, card: &dyn CardBackend, record: &mut HealthCardRecord) -> Result<()> {
        command(card, &apdu::SELECT_DF_HCA)?;
        let raw = read_file(card, self.short_id, self.mode, self.capacity)?;
        let plain = inflate_checked(&raw)?;
        let text = xml::decode_text(&plain);
        let doc = xml::parse(&text)?;

        let root = doc.root_element();
        for (key, path) in self.fields {
            let value = extract(root, path);
            if value.is_none() {
                debug!(key, "Field not present");
            }
            record.insert(key, value);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::session::{APDU_SUCCESS, CardType};
    use inflate::gzip;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeState {
        answers: HashMap<Vec<u8>, Vec<u8>>,
        files: HashMap<u8, Vec<u8>>,
        current: Option<u8>,
        response: Vec<u8>,
        reads: Vec<(usize, usize)>,
        short_writes: bool,
    }

    /// Processor card answering fixed APDUs and READ BINARY on its files.
    pub(crate) struct FakeCard {
        card_type: CardType,
        state: Mutex<FakeState>,
    }

    impl FakeCard {
        pub(crate) fn new() -> Self {
            Self::with_type(CardType::T1)
        }

        pub(crate) fn with_type(card_type: CardType) -> Self {
            Self {
                card_type,
                state: Mutex::new(FakeState::default()),
            }
        }

        pub(crate) fn with_file(short_id: u8, data: &[u8]) -> Self {
            let card = Self::new();
            card.add_file(short_id, data);
            card
        }

        pub(crate) fn add_file(&self, short_id: u8, data: &[u8]) {
            self.state.lock().files.insert(short_id, data.to_vec());
        }

        /// Answer `apdu` with `response`, trailer included.
        pub(crate) fn answer(&self, apdu: &[u8], response: &[u8]) {
            self.state
                .lock()
                .answers
                .insert(apdu.to_vec(), response.to_vec());
        }

        pub(crate) fn set_short_writes(&self, short: bool) {
            self.state.lock().short_writes = short;
        }

        /// `(offset, length)` of every READ BINARY on a file.
        pub(crate) fn reads(&self) -> Vec<(usize, usize)> {
            self.state.lock().reads.clone()
        }

        pub(crate) fn length_prefixed(content: &[u8]) -> Vec<u8> {
            let mut file = (content.len() as u16).to_be_bytes().to_vec();
            file.extend_from_slice(content);
            file
        }

        pub(crate) fn offset_prefixed(content: &[u8]) -> Vec<u8> {
            let start = 4u16;
            let end = start + content.len() as u16 - 1;
            let mut file = start.to_be_bytes().to_vec();
            file.extend_from_slice(&end.to_be_bytes());
            file.extend_from_slice(content);
            file
        }
    }

    impl CardBackend for FakeCard {
        fn card_type(&self) -> Result<CardType> {
            Ok(self.card_type)
        }

        fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
            let state = self.state.lock();
            let start = offset.min(state.response.len());
            let end = start.saturating_add(len).min(state.response.len());
            Ok(state.response[start..end].to_vec())
        }

        fn write(&self, _offset: usize, data: &[u8]) -> Result<usize> {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let response = if let Some(answer) = state.answers.get(data) {
                answer.clone()
            } else if let &[0x00, 0xB0, p1, p2, le] = data {
                let offset = if p1 & 0x80 != 0 {
                    state.current = Some(p1 & 0x1F);
                    usize::from(p2)
                } else {
                    usize::from(u16::from_be_bytes([p1, p2]))
                };
                match state.current.and_then(|id| state.files.get(&id)) {
                    Some(file) => {
                        let start = offset.min(file.len());
                        let end = (start + usize::from(le)).min(file.len());
                        let mut response = file[start..end].to_vec();
                        response.extend_from_slice(&APDU_SUCCESS);
                        state.reads.push((offset, usize::from(le)));
                        response
                    }
                    None => vec![0x6A, 0x82],
                }
            } else {
                vec![0x6D, 0x00]
            };
            state.response = response;
            if state.short_writes {
                return Ok(data.len().saturating_sub(1));
            }
            Ok(data.len())
        }
    }

    const ATR: [u8; 4] = [0x3B, 0xD3, 0x96, 0xFF];

    const PD_XML: &str = r#"<?xml version="1.0" encoding="ISO-8859-15" standalone="yes"?>
<vsd:UC_PersoenlicheVersichertendatenXML xmlns:vsd="http://ws.gematik.de/fa/vsds/UC_PersoenlicheVersichertendatenXML/v5.2">
  <vsd:Versicherter>
    <vsd:Versicherten_ID>X110411675</vsd:Versicherten_ID>
    <vsd:Person>
      <vsd:Geburtsdatum>19640812</vsd:Geburtsdatum>
      <vsd:Vorname>Juna</vsd:Vorname>
      <vsd:Nachname>Fuchs</vsd:Nachname>
      <vsd:Geschlecht>W</vsd:Geschlecht>
      <vsd:StrassenAdresse>
        <vsd:Postleitzahl>10117</vsd:Postleitzahl>
        <vsd:Ort>Berlin</vsd:Ort>
        <vsd:Land><vsd:Wohnsitzlaendercode>D</vsd:Wohnsitzlaendercode></vsd:Land>
        <vsd:Strasse>Friedrichstr.</vsd:Strasse>
        <vsd:Hausnummer>136</vsd:Hausnummer>
      </vsd:StrassenAdresse>
    </vsd:Person>
  </vsd:Versicherter>
</vsd:UC_PersoenlicheVersichertendatenXML>"#;

    const VD_XML: &str = r#"<?xml version="1.0" encoding="ISO-8859-15" standalone="yes"?>
<vsda:UC_AllgemeineVersicherungsdatenXML xmlns:vsda="http://ws.gematik.de/fa/vsds/UC_AllgemeineVersicherungsdatenXML/v5.2">
  <vsda:Versicherter>
    <vsda:Versicherungsschutz>
      <vsda:Beginn>20070101</vsda:Beginn>
      <vsda:Kostentraeger>
        <vsda:Kostentraegerkennung>109500969</vsda:Kostentraegerkennung>
        <vsda:Kostentraegerlaendercode>D</vsda:Kostentraegerlaendercode>
        <vsda:Name>Test GKV-SV</vsda:Name>
        <vsda:AbrechnenderKostentraeger>
          <vsda:Kostentraegerkennung>109500970</vsda:Kostentraegerkennung>
          <vsda:Kostentraegerlaendercode>D</vsda:Kostentraegerlaendercode>
          <vsda:Name>Abrechnungsstelle</vsda:Name>
        </vsda:AbrechnenderKostentraeger>
      </vsda:Kostentraeger>
    </vsda:Versicherungsschutz>
  </vsda:Versicherter>
</vsda:UC_AllgemeineVersicherungsdatenXML>"#;

    fn with_trailer(payload: &[u8]) -> Vec<u8> {
        let mut response = payload.to_vec();
        response.extend_from_slice(&APDU_SUCCESS);
        response
    }

    fn egk() -> FakeCard {
        let card = FakeCard::new();
        card.answer(&apdu::REQUEST_ICC, &with_trailer(&ATR));
        card.answer(&apdu::SELECT_EGK_ROOT, &APDU_SUCCESS);
        card.answer(&apdu::SELECT_DF_HCA, &APDU_SUCCESS);
        card.answer(
            &apdu::READ_EF_GDO,
            &with_trailer(&[0x5A, 0x0A, 0x80, 0x27, 0x60, 0x01, 0x23]),
        );
        card.answer(&apdu::READ_EF_ATR, &with_trailer(&[0xE0, 0x10, 0x02, 0x02]));
        card.add_file(EF_PD_SHORT_ID, &FakeCard::length_prefixed(&gzip(PD_XML.as_bytes())));
        card.add_file(EF_VD_SHORT_ID, &FakeCard::offset_prefixed(&gzip(VD_XML.as_bytes())));
        card
    }

    #[test]
    fn test_read_info_full_card() {
        let record = read_info(&egk()).unwrap();

        assert_eq!(record.get("atr"), Some("3BD396FF"));
        assert_eq!(record.get("card.id"), Some("8027600123"));
        assert_eq!(record.get("card.atr"), Some("E0100202"));
        assert_eq!(record.get("insurant.person.firstName"), Some("Juna"));
        assert_eq!(record.get("insurant.person.lastName"), Some("Fuchs"));
        assert_eq!(record.get("insurant.person.dateOfBirth"), Some("19640812"));
        assert_eq!(record.get("insurant.person.country"), Some("D"));
        assert_eq!(record.get("insurant.person.streetNumber"), Some("136"));
        assert_eq!(record.get("insurant.insuranceId"), Some("X110411675"));
        assert_eq!(record.get("insurer.id"), Some("109500969"));
        assert_eq!(record.get("insurer.name"), Some("Test GKV-SV"));
        assert_eq!(record.get("insurer.billing.id"), Some("109500970"));
        assert_eq!(record.get("insurer.billing.name"), Some("Abrechnungsstelle"));

        // Missing elements are present as keys without value.
        assert!(record.contains_key("insurant.person.poBox"));
        assert_eq!(record.get("insurant.person.poBox"), None);

        let keys: Vec<&str> = record.keys().collect();
        assert_eq!(&keys[..4], &["atr", "card.id", "card.atr", "insurant.person.firstName"]);
        assert_eq!(keys.len(), 3 + PD_FIELDS.len() + VD_FIELDS.len());
        assert_eq!(keys.last(), Some(&"insurer.billing.name"));
    }

    #[test]
    fn test_broken_ef_pd_keeps_other_fields() {
        let card = egk();
        let mut broken = gzip(PD_XML.as_bytes());
        let crc = broken.len() - 8;
        broken[crc] ^= 0xFF;
        card.add_file(EF_PD_SHORT_ID, &FakeCard::length_prefixed(&broken));

        let record = read_info(&card).unwrap();
        assert_eq!(record.get("card.id"), Some("8027600123"));
        assert_eq!(record.get("card.atr"), Some("E0100202"));
        assert!(record.keys().all(|k| !k.starts_with("insurant.")));
        assert_eq!(record.get("insurer.id"), Some("109500969"));
    }

    #[test]
    fn test_missing_identity_files() {
        let card = egk();
        card.answer(&apdu::SELECT_EGK_ROOT, &[0x6A, 0x82]);
        let record = read_info(&card).unwrap();
        assert!(!record.contains_key("card.id"));
        assert!(!record.contains_key("card.atr"));
        assert_eq!(record.get("insurant.person.city"), Some("Berlin"));
    }

    #[test]
    fn test_short_gdo_is_skipped() {
        let card = egk();
        card.answer(&apdu::READ_EF_GDO, &with_trailer(&[0x5A, 0x00]));
        let record = read_info(&card).unwrap();
        assert!(!record.contains_key("card.id"));
        assert!(record.contains_key("card.atr"));
    }

    #[test]
    fn test_atr_failure_is_fatal() {
        let card = egk();
        card.answer(&apdu::REQUEST_ICC, &[0x64, 0x00]);
        assert_eq!(read_info(&card), Err(Error::NoData));
    }

    #[test]
    fn test_non_iso_card_rejected() {
        for card_type in [CardType::I2c, CardType::Unknown] {
            let card = FakeCard::with_type(card_type);
            assert_eq!(read_info(&card), Err(Error::InvalidArgument));
        }
    }
}
