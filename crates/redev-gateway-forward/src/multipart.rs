use redev_gateway_core::MultipartForm;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMultipart {
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Re-encodes a parsed form as `multipart/form-data` with the given boundary.
///
/// Text fields come first in their original order, then the file part.
#[must_use]
pub fn encode_multipart(form: &MultipartForm, boundary: &str) -> EncodedMultipart {
    let mut body = Vec::new();
    for (name, value) in &form.fields {
        push_line(&mut body, &format!("--{boundary}"));
        push_line(
            &mut body,
            &format!("Content-Disposition: form-data; name=\"{}\"", quoted(name)),
        );
        push_line(&mut body, "");
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    if let Some(file) = &form.file {
        push_line(&mut body, &format!("--{boundary}"));
        let mut disposition = format!(
            "Content-Disposition: form-data; name=\"{}\"",
            quoted(&file.field_name)
        );
        if let Some(file_name) = &file.file_name {
            disposition.push_str(&format!("; filename=\"{}\"", quoted(file_name)));
        }
        push_line(&mut body, &disposition);
        push_line(
            &mut body,
            &format!(
                "Content-Type: {}",
                file.content_type
                    .as_deref()
                    .unwrap_or("application/octet-stream")
            ),
        );
        push_line(&mut body, "");
        body.extend_from_slice(&file.bytes);
        body.extend_from_slice(b"\r\n");
    }
    push_line(&mut body, &format!("--{boundary}--"));

    EncodedMultipart {
        content_type: format!("multipart/form-data; boundary={boundary}"),
        body,
    }
}

fn push_line(body: &mut Vec<u8>, line: &str) {
    body.extend_from_slice(line.as_bytes());
    body.extend_from_slice(b"\r\n");
}

fn quoted(value: &str) -> String {
    value
        .chars()
        .filter(|ch| *ch != '\r' && *ch != '\n')
        .collect::<String>()
        .replace('"', "%22")
}
