use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use valtown_lib::{Val, ValPrivacy};

use crate::config::ValfsConfig;

/// Upper bound on what the frontmatter adds to a val's code. Used as the
/// reported size of a val whose code has not been fetched yet.
pub const FRONTMATTER_OVERHEAD: u64 = 500;

const READ_ONLY_TAG: &str = "# (read-only)";

static FRONTMATTER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?sm)/\*---\n(.*?)^---\*/\n").expect("frontmatter regex is valid")
});

static SHEBANG: Lazy<Option<String>> = Lazy::new(|| {
    std::env::current_exe()
        .ok()
        .map(|path| format!("#!{}\n\n", path.display()))
});

#[derive(Error, Debug, PartialEq)]
pub enum PackageError {
    #[error("no frontmatter block found")]
    InvalidFrontmatter,
    #[error("no code after the frontmatter block")]
    TooShort,
    #[error("frontmatter yaml: {0}")]
    Yaml(String),
}

pub type PackageResult<T> = std::result::Result<T, PackageError>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LinksOut<'a> {
    valtown: &'a str,
    esm_module: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    deployment: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
}

#[derive(Serialize)]
struct FrontmatterOut<'a> {
    id: &'a str,
    version: u64,
    privacy: ValPrivacy,
    links: LinksOut<'a>,
    readme: Option<&'a str>,
}

// Everything else in the block is informational and ignored on the way in.
#[derive(Deserialize, Default)]
struct FrontmatterIn {
    #[serde(default)]
    privacy: Option<ValPrivacy>,
    #[serde(default)]
    readme: Option<String>,
}

fn esm_module(module: &str, static_meta: bool) -> String {
    if static_meta {
        module.split('?').next().unwrap_or(module).to_string()
    } else {
        module.to_string()
    }
}

fn mark_read_only(yaml: &str) -> String {
    let mut out = String::with_capacity(yaml.len() + 64);
    let mut in_links = false;
    for line in yaml.lines() {
        let nested = line.starts_with(' ');
        if !nested {
            in_links = line == "links:";
        }
        let tagged = line.starts_with("id:") || line.starts_with("version:") || (in_links && nested);
        out.push_str(line);
        if tagged {
            out.push_str("  ");
            out.push_str(READ_ONLY_TAG);
        }
        out.push('\n');
    }
    out
}

/// Serializes `val` into the frontmatter-plus-code text shown in `vals/`.
pub fn to_text(val: &Val, config: &ValfsConfig) -> PackageResult<String> {
    let frontmatter = FrontmatterOut {
        id: &val.id,
        version: val.version,
        privacy: val.privacy,
        links: LinksOut {
            valtown: &val.links.website,
            esm_module: esm_module(&val.links.module, config.static_meta),
            deployment: val.links.endpoint.as_deref(),
            email: val.links.email.as_deref(),
        },
        readme: val.readme.as_deref(),
    };
    let yaml =
        serde_yaml_ng::to_string(&frontmatter).map_err(|e| PackageError::Yaml(e.to_string()))?;

    let mut text = String::with_capacity(yaml.len() + val.code.len() + 64);
    if config.executable_vals {
        if let Some(shebang) = SHEBANG.as_deref() {
            text.push_str(shebang);
        }
    }
    text.push_str("/*---\n");
    text.push_str(&mark_read_only(&yaml));
    text.push_str("---*/\n\n");
    text.push_str(&val.code);
    Ok(text)
}

/// Applies the editable parts of `text` (privacy, readme, code) to `val`.
/// `val` is left untouched when an error is returned.
pub fn update_val(val: &mut Val, text: &str) -> PackageResult<()> {
    let caps = FRONTMATTER_RE
        .captures(text)
        .ok_or(PackageError::InvalidFrontmatter)?;
    let (Some(whole), Some(yaml)) = (caps.get(0), caps.get(1)) else {
        return Err(PackageError::InvalidFrontmatter);
    };

    let rest = &text[whole.end()..];
    if rest.is_empty() {
        return Err(PackageError::TooShort);
    }
    let code = rest.strip_prefix('\n').unwrap_or(rest);

    let parsed: FrontmatterIn = if yaml.as_str().trim().is_empty() {
        FrontmatterIn::default()
    } else {
        serde_yaml_ng::from_str(yaml.as_str()).map_err(|e| PackageError::Yaml(e.to_string()))?
    };

    if let Some(privacy) = parsed.privacy {
        val.privacy = privacy;
    }
    val.readme = parsed.readme;
    val.code = code.to_string();
    Ok(())
}

/// True when `text` carries a frontmatter block at all.
pub fn has_frontmatter(text: &str) -> bool {
    FRONTMATTER_RE.is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use valtown_lib::{ValLinks, ValType};

    fn sample_val() -> Val {
        Val {
            id: "0193a1b2-aaaa".to_string(),
            name: "hello".to_string(),
            val_type: ValType::Http,
            privacy: ValPrivacy::Unlisted,
            version: 7,
            code: "export default () => new Response(\"hi\");\n".to_string(),
            readme: Some("# Hello\n\nSays hi.\n".to_string()),
            author: None,
            links: ValLinks {
                website: "https://www.val.town/v/alice/hello".to_string(),
                module: "https://esm.town/v/alice/hello?v=7".to_string(),
                endpoint: Some("https://alice-hello.web.val.run".to_string()),
                email: None,
            },
            created_at: None,
        }
    }

    #[test]
    fn test_to_text_layout() {
        let text = to_text(&sample_val(), &ValfsConfig::default()).unwrap();
        assert!(text.starts_with("/*---\nid: "));
        assert!(text.ends_with("---*/\n\nexport default () => new Response(\"hi\");\n"));
        assert!(text.contains("version: 7  # (read-only)\n"));
        assert!(text.contains("esmModule: https://esm.town/v/alice/hello?v=7  # (read-only)"));
        assert!(text.contains("deployment: https://alice-hello.web.val.run  # (read-only)"));
        assert!(!text.contains("email:"));
        assert!(!text.contains("privacy: unlisted  #"));

        let id = text.find("id:").unwrap();
        let version = text.find("version:").unwrap();
        let privacy = text.find("privacy:").unwrap();
        let links = text.find("links:").unwrap();
        let readme = text.find("readme:").unwrap();
        assert!(id < version && version < privacy && privacy < links && links < readme);
    }

    #[test]
    fn test_round_trip_keeps_editable_fields() {
        let config = ValfsConfig::default();
        let cases = vec![
            sample_val(),
            Val {
                readme: None,
                code: String::new(),
                ..sample_val()
            },
            Val {
                privacy: ValPrivacy::Private,
                readme: Some("one line".to_string()),
                code: "\n\nconst x = 1;\n/* not frontmatter */".to_string(),
                ..sample_val()
            },
        ];
        for original in cases {
            let text = to_text(&original, &config).unwrap();
            let mut decoded = Val {
                privacy: ValPrivacy::Public,
                readme: Some("stale".to_string()),
                code: "stale".to_string(),
                ..sample_val()
            };
            update_val(&mut decoded, &text).unwrap();
            assert_eq!(decoded.privacy, original.privacy);
            assert_eq!(decoded.readme, original.readme);
            assert_eq!(decoded.code, original.code);
            assert_eq!(to_text(&decoded, &config).unwrap(), text);
        }
    }

    #[test]
    fn test_readme_with_closing_marker_round_trips() {
        let config = ValfsConfig::default();
        let original = Val {
            readme: Some("a ---*/\nb".to_string()),
            code: "code();\n".to_string(),
            ..sample_val()
        };
        let text = to_text(&original, &config).unwrap();
        let mut decoded = sample_val();
        update_val(&mut decoded, &text).unwrap();
        assert_eq!(decoded.readme, original.readme);
        assert_eq!(decoded.code, "code();\n");
        assert_eq!(to_text(&decoded, &config).unwrap(), text);
    }

    #[test]
    fn test_static_meta_strips_module_query() {
        let config = ValfsConfig {
            static_meta: true,
            ..ValfsConfig::default()
        };
        let text = to_text(&sample_val(), &config).unwrap();
        assert!(text.contains("esmModule: https://esm.town/v/alice/hello  #"));
        assert!(!text.contains("?v=7"));
    }

    #[test]
    fn test_executable_vals_prefix_shebang() {
        let config = ValfsConfig {
            executable_vals: true,
            ..ValfsConfig::default()
        };
        let text = to_text(&sample_val(), &config).unwrap();
        assert!(text.starts_with("#!"));
        assert!(text.contains("\n\n/*---\n"));

        let mut decoded = sample_val();
        decoded.code.clear();
        update_val(&mut decoded, &text).unwrap();
        assert_eq!(decoded.code, sample_val().code);
    }

    #[test]
    fn test_edit_privacy_and_code() {
        let text = to_text(&sample_val(), &ValfsConfig::default()).unwrap();
        let edited = text
            .replace("privacy: unlisted", "privacy: public")
            .replace("new Response(\"hi\")", "new Response(\"bye\")");
        let mut val = sample_val();
        update_val(&mut val, &edited).unwrap();
        assert_eq!(val.privacy, ValPrivacy::Public);
        assert!(val.code.contains("bye"));
        assert_eq!(val.version, 7);
    }

    #[test]
    fn test_decode_errors() {
        let mut val = sample_val();
        assert_eq!(
            update_val(&mut val, "console.log(1)"),
            Err(PackageError::InvalidFrontmatter)
        );
        assert_eq!(
            update_val(&mut val, "/*---\nprivacy: public\n---*/\n"),
            Err(PackageError::TooShort)
        );
        assert!(matches!(
            update_val(&mut val, "/*---\nprivacy: [oops\n---*/\n\ncode"),
            Err(PackageError::Yaml(_))
        ));
        assert!(matches!(
            update_val(&mut val, "/*---\nprivacy: secret\n---*/\n\ncode"),
            Err(PackageError::Yaml(_))
        ));
        assert_eq!(val, sample_val());
    }

    #[test]
    fn test_has_frontmatter() {
        assert!(has_frontmatter("/*---\n---*/\n\n"));
        assert!(!has_frontmatter("let a = 1;"));
    }
}
