//! Upload filename sanitizing.

const MAX_STEM_CHARS: usize = 20;

const WINDOWS_DEVICES: &[&str] = &[
    "CON", "AUX", "COM1", "COM2", "COM3", "COM4", "LPT1", "LPT2", "LPT3", "PRN", "NUL",
];

fn allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Reduces a client-supplied filename to something safe to store and display:
/// the basename only, a stem of at most 20 characters from `[A-Za-z0-9_.-]`,
/// and `_` when nothing usable is left.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let (stem, ext) = split_ext(base);

    let stem: String = stem.chars().take(MAX_STEM_CHARS).filter(|c| allowed(*c)).collect();
    let mut stem = stem.trim_matches(|c| c == '.' || c == '_').to_string();
    if stem.is_empty() {
        stem.push('_');
    }
    let ext: String = ext.chars().filter(|c| allowed(*c)).collect();

    let device = stem.split('.').next().unwrap_or_default().to_ascii_uppercase();
    if WINDOWS_DEVICES.contains(&device.as_str()) {
        stem.insert(0, '_');
    }
    stem + &ext
}

/// `("archive.tar", ".gz")`; leading dots belong to the stem.
fn split_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) if name[..i].chars().any(|c| c != '.') => name.split_at(i),
        _ => (name, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("bash-count.rpz"), "bash-count.rpz");
        assert_eq!(sanitize_filename("/home/user/exp.rpz"), "exp.rpz");
        assert_eq!(sanitize_filename("C:\\Users\\me\\exp.rpz"), "exp.rpz");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("my experiment (1).rpz"), "myexperiment1.rpz");
        assert_eq!(
            sanitize_filename("a-very-long-experiment-name-indeed.rpz"),
            "a-very-long-experime.rpz"
        );
        assert_eq!(sanitize_filename(""), "_");
        assert_eq!(sanitize_filename("...."), "_");
        assert_eq!(sanitize_filename(".rpz"), "rpz");
        assert_eq!(sanitize_filename("étude.rpz"), "tude.rpz");
        assert_eq!(sanitize_filename("con.rpz"), "_con.rpz");
    }
}
