//! The `asset://` URL grammar.
//!
//! `asset://<hash>.<ext>` where `<hash>` is 64 lowercase hex characters
//! (SHA-256 of the content) and `<ext>` is drawn from the closed extension
//! set. The hash makes URLs content-addressed: equality of hash implies
//! equality of bytes, which is what lets the cache treat entries as
//! immutable forever.

use sha2::{Digest, Sha256};

use crate::AssetError;

const SCHEME: &str = "asset://";

// ---------------------------------------------------------------------------
// AssetKind / AssetExt
// ---------------------------------------------------------------------------

/// The type axis of an asset key. The same bytes can be indexed under
/// different kinds (a glb used both as a model and as an emote source).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    /// Scene-graph source for an app.
    Model,
    /// Scene-graph source for a player avatar.
    Avatar,
    /// Animation clip.
    Emote,
    /// Plain texture.
    Texture,
    /// Environment map.
    Hdr,
    /// App script module.
    Script,
}

impl AssetKind {
    /// Lowercase name used in logs and persisted keys.
    pub fn name(self) -> &'static str {
        match self {
            AssetKind::Model => "model",
            AssetKind::Avatar => "avatar",
            AssetKind::Emote => "emote",
            AssetKind::Texture => "texture",
            AssetKind::Hdr => "hdr",
            AssetKind::Script => "script",
        }
    }
}

/// The closed set of file extensions accepted in asset URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetExt {
    /// Binary glTF scene.
    Glb,
    /// VRM avatar.
    Vrm,
    /// Radiance environment map.
    Hdr,
    /// JPEG image.
    Jpg,
    /// PNG image.
    Png,
    /// WebAssembly script (text or binary; wasmtime accepts both).
    Wat,
}

impl AssetExt {
    /// The extension string, without the dot.
    pub fn as_str(self) -> &'static str {
        match self {
            AssetExt::Glb => "glb",
            AssetExt::Vrm => "vrm",
            AssetExt::Hdr => "hdr",
            AssetExt::Jpg => "jpg",
            AssetExt::Png => "png",
            AssetExt::Wat => "wat",
        }
    }

    /// Parse an extension string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "glb" => Some(AssetExt::Glb),
            "vrm" => Some(AssetExt::Vrm),
            "hdr" => Some(AssetExt::Hdr),
            "jpg" => Some(AssetExt::Jpg),
            "png" => Some(AssetExt::Png),
            "wat" => Some(AssetExt::Wat),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// AssetUrl
// ---------------------------------------------------------------------------

/// A parsed, validated content-addressed asset URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetUrl {
    hash: String,
    ext: AssetExt,
}

impl AssetUrl {
    /// Parse and validate an `asset://` URL.
    ///
    /// # Errors
    ///
    /// [`AssetError::InvalidUrl`] if the scheme, hash or extension is off.
    pub fn parse(url: &str) -> Result<Self, AssetError> {
        let invalid = |reason| AssetError::InvalidUrl {
            url: url.to_owned(),
            reason,
        };

        let rest = url.strip_prefix(SCHEME).ok_or(invalid("missing scheme"))?;
        let (hash, ext) = rest.rsplit_once('.').ok_or(invalid("missing extension"))?;
        if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return Err(invalid("hash is not 64 lowercase hex characters"));
        }
        let ext = AssetExt::parse(ext).ok_or(invalid("unknown extension"))?;
        Ok(Self {
            hash: hash.to_owned(),
            ext,
        })
    }

    /// Mint the URL for locally produced bytes.
    pub fn for_bytes(bytes: &[u8], ext: AssetExt) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut hash = String::with_capacity(64);
        for byte in digest {
            hash.push_str(&format!("{byte:02x}"));
        }
        Self { hash, ext }
    }

    /// The content hash, 64 lowercase hex characters.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The file extension.
    pub fn ext(&self) -> AssetExt {
        self.ext
    }

    /// Render back to the canonical `asset://<hash>.<ext>` string.
    pub fn to_url_string(&self) -> String {
        format!("{SCHEME}{}.{}", self.hash, self.ext.as_str())
    }
}

impl std::fmt::Display for AssetUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_url_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_and_parse_roundtrip() {
        let url = AssetUrl::for_bytes(b"cube bytes", AssetExt::Glb);
        let rendered = url.to_url_string();
        assert!(rendered.starts_with("asset://"));
        assert!(rendered.ends_with(".glb"));
        assert_eq!(AssetUrl::parse(&rendered).unwrap(), url);
    }

    #[test]
    fn identical_bytes_mint_identical_urls() {
        let a = AssetUrl::for_bytes(b"same", AssetExt::Png);
        let b = AssetUrl::for_bytes(b"same", AssetExt::Png);
        assert_eq!(a, b);
        let c = AssetUrl::for_bytes(b"different", AssetExt::Png);
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn parse_rejects_bad_urls() {
        for bad in [
            "http://example.com/a.glb",
            "asset://short.glb",
            &format!("asset://{}.exe", "a".repeat(64)),
            &format!("asset://{}", "a".repeat(64)),
            &format!("asset://{}.glb", "A".repeat(64)),
            &format!("asset://{}.glb", "z".repeat(64)),
        ] {
            assert!(
                matches!(AssetUrl::parse(bad), Err(AssetError::InvalidUrl { .. })),
                "should reject {bad:?}"
            );
        }
    }

    #[test]
    fn all_extensions_parse() {
        for ext in [
            AssetExt::Glb,
            AssetExt::Vrm,
            AssetExt::Hdr,
            AssetExt::Jpg,
            AssetExt::Png,
            AssetExt::Wat,
        ] {
            assert_eq!(AssetExt::parse(ext.as_str()), Some(ext));
        }
    }
}
