use once_cell::sync::Lazy;
use regex::Regex;
use valtown_lib::ValType;

pub const VAL_FILE_EXT: &str = "tsx";

static BLOB_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\x00-\x1f/]+$").expect("blob key regex is valid"));

fn type_abbrev(val_type: ValType) -> Option<&'static str> {
    match val_type {
        ValType::Script => Some("S"),
        ValType::Http => Some("H"),
        ValType::Interval => Some("C"),
        ValType::Email => Some("E"),
        ValType::Unknown => None,
    }
}

fn abbrev_type(abbrev: &str) -> ValType {
    match abbrev {
        "S" => ValType::Script,
        "H" => ValType::Http,
        "C" => ValType::Interval,
        "E" => ValType::Email,
        _ => ValType::Unknown,
    }
}

/// `hello.S.tsx` -> `("hello", Script)`. Anything that does not follow the
/// `<base>.<abbrev>.tsx` grammar yields `Unknown`.
pub fn extract_from_val_filename(filename: &str) -> (String, ValType) {
    let parts: Vec<&str> = filename.rsplitn(3, '.').collect();
    if let [ext, abbrev, base] = parts.as_slice() {
        if *ext == VAL_FILE_EXT && !base.is_empty() {
            let val_type = abbrev_type(abbrev);
            if val_type != ValType::Unknown {
                return (base.to_string(), val_type);
            }
        }
    }
    let base = filename
        .strip_suffix(&format!(".{}", VAL_FILE_EXT))
        .unwrap_or(filename);
    (base.to_string(), ValType::Unknown)
}

pub fn construct_val_filename(base: &str, val_type: ValType) -> String {
    match type_abbrev(val_type) {
        Some(abbrev) => format!("{}.{}.{}", base, abbrev, VAL_FILE_EXT),
        None => format!("{}.{}", base, VAL_FILE_EXT),
    }
}

pub fn is_valid_blob_key(key: &str) -> bool {
    key != "." && key != ".." && BLOB_KEY_RE.is_match(key)
}
