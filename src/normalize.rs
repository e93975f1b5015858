/// Canonicalize a user-supplied image reference to the form used as a
/// matching key throughout the server (pods ↔ pulls). Pure and idempotent —
/// see §4.2.
pub fn normalize_image_ref(image_ref: &str) -> String {
    let mut out = image_ref.to_string();

    if !out.contains('/') {
        out = format!("docker.io/library/{out}");
    } else {
        let first_segment = out.split('/').next().unwrap_or("");
        if !first_segment.contains('.') && !first_segment.contains(':') {
            out = format!("docker.io/{out}");
        }
    }

    if !out.contains(':') && !out.contains('@') {
        out = format!("{out}:latest");
    }

    out
}

/// Parse the `<ref>` out of a `Pulling image "<ref>"` event message.
pub fn parse_pulling_message(message: &str) -> Option<String> {
    parse_between_quotes(message, "Pulling image \"")
}

/// Parse the `<ref>` out of a `Successfully pulled image "<ref>" ...` message.
pub fn parse_pulled_message(message: &str) -> Option<String> {
    parse_between_quotes(message, "Successfully pulled image \"")
}

fn parse_between_quotes(message: &str, prefix: &str) -> Option<String> {
    let start = message.find(prefix)? + prefix.len();
    let rest = &message[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}
