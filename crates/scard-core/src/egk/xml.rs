//! Field lookup in the card's XML documents.

use std::borrow::Cow;

use roxmltree::{Document, Node};

use crate::error::{Error, Result};

/// Document text. Input that is not UTF-8 is decoded as ISO-8859-15, the
/// charset the card declares.
pub fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => Cow::Owned(bytes.iter().map(|&b| latin9_char(b)).collect()),
    }
}

/// ISO-8859-15 differs from Latin-1 in eight code points.
fn latin9_char(b: u8) -> char {
    match b {
        0xA4 => '\u{20AC}',
        0xA6 => '\u{0160}',
        0xA8 => '\u{0161}',
        0xB4 => '\u{017D}',
        0xB8 => '\u{017E}',
        0xBC => '\u{0152}',
        0xBD => '\u{0153}',
        0xBE => '\u{0178}',
        other => char::from(other),
    }
}

/// Parse `text`, mapping any XML error to [`Error::Io`].
pub fn parse(text: &str) -> Result<Document<'_>> {
    Document::parse(text).map_err(|e| Error::Io(format!("XML: {e}")))
}

/// Follow `path` by element name starting at `node` and its siblings.
///
/// Each step matches the first element with that local name, then descends
/// into its children. Returns the text of the last element.
pub fn extract(node: Node<'_, '_>, path: &[&str]) -> Option<String> {
    let (name, rest) = path.split_first()?;
    let found = std::iter::successors(Some(node), |n| n.next_sibling())
        .find(|n| n.is_element() && n.tag_name().name() == *name)?;
    if rest.is_empty() {
        found.text().map(str::to_string)
    } else {
        extract(found.first_child()?, rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PD: &str = r#"<?xml version="1.0" encoding="ISO-8859-15" standalone="yes"?>
<vsd:UC_PersoenlicheVersichertendatenXML xmlns:vsd="http://ws.gematik.de/fa/vsds/UC_PersoenlicheVersichertendatenXML/v5.2" CDM_VERSION="5.2.0">
  <vsd:Versicherter>
    <vsd:Versicherten_ID>X110411675</vsd:Versicherten_ID>
    <vsd:Person>
      <vsd:Geburtsdatum>19640812</vsd:Geburtsdatum>
      <vsd:Vorname>Juna</vsd:Vorname>
      <vsd:Nachname>Fuchs</vsd:Nachname>
      <vsd:Titel/>
      <vsd:StrassenAdresse>
        <vsd:Postleitzahl>10117</vsd:Postleitzahl>
        <vsd:Ort>Berlin</vsd:Ort>
        <vsd:Land><vsd:Wohnsitzlaendercode>D</vsd:Wohnsitzlaendercode></vsd:Land>
      </vsd:StrassenAdresse>
    </vsd:Person>
  </vsd:Versicherter>
</vsd:UC_PersoenlicheVersichertendatenXML>"#;

    const ROOT: &str = "UC_PersoenlicheVersichertendatenXML";

    #[test]
    fn test_extract_paths() {
        let doc = parse(PD).unwrap();
        let root = doc.root_element();
        assert_eq!(
            extract(root, &[ROOT, "Versicherter", "Person", "Vorname"]).as_deref(),
            Some("Juna")
        );
        assert_eq!(
            extract(root, &[ROOT, "Versicherter", "Versicherten_ID"]).as_deref(),
            Some("X110411675")
        );
        assert_eq!(
            extract(
                root,
                &[ROOT, "Versicherter", "Person", "StrassenAdresse", "Land", "Wohnsitzlaendercode"]
            )
            .as_deref(),
            Some("D")
        );
    }

    #[test]
    fn test_missing_paths() {
        let doc = parse(PD).unwrap();
        let root = doc.root_element();
        assert_eq!(extract(root, &[ROOT, "Versicherter", "Person", "Namenszusatz"]), None);
        assert_eq!(extract(root, &[ROOT, "Versicherter", "Person", "Titel"]), None);
        assert_eq!(extract(root, &["Other", "Versicherter"]), None);
        assert_eq!(extract(root, &[]), None);
    }

    #[test]
    fn test_latin9_differences() {
        let text = decode_text(b"\xA4 \xA6\xA8 \xB4\xB8 \xBC\xBD \xBE \xE9");
        assert_eq!(text, "€ Šš Žž Œœ Ÿ é");
    }

    #[test]
    fn test_latin1_fallback() {
        let bytes = b"<a>M\xFCller</a>";
        let text = decode_text(bytes);
        assert_eq!(text, "<a>Müller</a>");
        let doc = parse(&text).unwrap();
        assert_eq!(extract(doc.root_element(), &["a"]).as_deref(), Some("Müller"));
        assert!(matches!(decode_text(b"plain"), Cow::Borrowed("plain")));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(parse("<a><b></a>"), Err(Error::Io(_))));
    }
}
