//! AN-013: BLAKE3 hashing for templates and resources.

use crate::core::types::SynthesizedResource;
use crate::error::Result;

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Hash one synthesized resource: type, properties and DependsOn.
/// The logical id is not hashed.
pub fn hash_resource(resource: &SynthesizedResource) -> Result<String> {
    let properties = serde_json::to_string(&resource.properties)?;
    let depends_on = resource.depends_on.join(",");
    Ok(composite_hash(&[
        resource.kind.type_name(),
        &properties,
        &depends_on,
    ]))
}

/// Compute a composite hash from multiple component hashes.
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ResourceKind;

    fn resource(cidr: &str) -> SynthesizedResource {
        let mut properties = serde_json::Map::new();
        properties.insert("CidrBlock".into(), serde_json::Value::String(cidr.into()));
        SynthesizedResource {
            kind: ResourceKind::Vpc,
            logical_id: "Vpc".into(),
            properties,
            depends_on: vec![],
        }
    }

    #[test]
    fn test_an013_hash_string() {
        let h1 = hash_string("hello");
        let h2 = hash_string("hello");
        let h3 = hash_string("world");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 7 + 64); // "blake3:" + 64 hex chars
    }

    #[test]
    fn test_an013_hash_resource_tracks_properties() {
        let a = hash_resource(&resource("10.0.0.0/16")).unwrap();
        let b = hash_resource(&resource("10.0.0.0/16")).unwrap();
        let c = hash_resource(&resource("10.1.0.0/16")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_an013_hash_resource_tracks_depends_on() {
        let plain = resource("10.0.0.0/16");
        let mut ordered = plain.clone();
        ordered.depends_on.push("Igw".into());
        assert_ne!(
            hash_resource(&plain).unwrap(),
            hash_resource(&ordered).unwrap()
        );
    }

    #[test]
    fn test_an013_composite_hash_separates_components() {
        assert_ne!(composite_hash(&["ab", "c"]), composite_hash(&["a", "bc"]));
    }
}
