//! multipart/form-data parsing for the transcription endpoint.

use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct MultipartPart {
    pub name: String,
    pub filename: Option<String>,
    pub content: Vec<u8>,
}

/// Pull the boundary out of a Content-Type header.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"').to_string())
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Split a multipart body on its boundary and parse each part's
/// Content-Disposition header.
pub fn parse_multipart(body: &[u8], boundary: &str) -> HashMap<String, MultipartPart> {
    let mut parts = HashMap::new();
    let marker = format!("--{boundary}");
    let marker = marker.as_bytes();

    let mut pos = 0usize;
    while let Some(start) = find(body, marker, pos) {
        let mut cursor = start + marker.len();
        if body.get(cursor..cursor + 2) == Some(b"--") {
            break; // closing boundary
        }
        cursor += 2; // skip CRLF after the boundary
        let Some(end) = find(body, marker, cursor) else {
            break;
        };
        // Part content ends before the CRLF preceding the next boundary.
        let part_data = &body[cursor..end.saturating_sub(2)];

        if let Some(header_end) = find(part_data, b"\r\n\r\n", 0) {
            let headers = String::from_utf8_lossy(&part_data[..header_end]);
            let mut part = MultipartPart {
                content: part_data[header_end + 4..].to_vec(),
                ..Default::default()
            };
            for line in headers.split("\r\n") {
                if !line
                    .to_ascii_lowercase()
                    .starts_with("content-disposition: form-data")
                {
                    continue;
                }
                for attr in line.split(';').map(str::trim) {
                    if let Some(name) = attr.strip_prefix("name=") {
                        part.name = name.trim_matches('"').to_string();
                    } else if let Some(filename) = attr.strip_prefix("filename=") {
                        part.filename = Some(filename.trim_matches('"').to_string());
                    }
                }
            }
            if !part.name.is_empty() {
                parts.insert(part.name.clone(), part);
            }
        }
        pos = end;
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_extraction() {
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=xyz123"),
            Some("xyz123".to_string())
        );
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=\"quoted\""),
            Some("quoted".to_string())
        );
        assert_eq!(boundary_from_content_type("application/json"), None);
    }

    #[test]
    fn test_parse_two_parts() {
        let body = b"--BOUND\r\n\
Content-Disposition: form-data; name=\"model\"\r\n\r\n\
whisper-v3\r\n\
--BOUND\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"clip.wav\"\r\n\
Content-Type: audio/wav\r\n\r\n\
RIFFdata\r\n\
--BOUND--\r\n";
        let parts = parse_multipart(body, "BOUND");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts["model"].content, b"whisper-v3");
        let file = &parts["file"];
        assert_eq!(file.filename.as_deref(), Some("clip.wav"));
        assert_eq!(file.content, b"RIFFdata");
    }

    #[test]
    fn test_garbage_body_yields_nothing() {
        assert!(parse_multipart(b"no boundaries here", "BOUND").is_empty());
    }
}
