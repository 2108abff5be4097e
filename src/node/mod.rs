//! 节点模型：Point（节点配置）、Tag（间接寻址）以及节点来源。

pub mod protocol;
pub mod source;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use protocol::{Protocol, SetStrategy};
pub use source::{MemoryNodes, NodeSource};

/// 节点配置。`hash` 是节点身份，也是 OutboundStore 的缓存键。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    #[serde(default)]
    pub hash: String,
    pub name: String,
    #[serde(default)]
    pub group: String,
    pub protocols: Vec<Protocol>,
}

impl Point {
    pub fn new(name: impl Into<String>, group: impl Into<String>, protocols: Vec<Protocol>) -> Self {
        let mut point = Self {
            hash: String::new(),
            name: name.into(),
            group: group.into(),
            protocols,
        };
        point.hash = point.content_hash();
        point
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }

    /// name/group/protocols 的规范 JSON 的 SHA-256（hex）
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::json!({
            "name": self.name,
            "group": self.group,
            "protocols": self.protocols,
        });
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        hex_encode(&digest)
    }

    /// 未显式给出 hash 时按内容生成
    pub fn ensure_hash(&mut self) {
        if self.hash.is_empty() {
            self.hash = self.content_hash();
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    /// 指向一个或多个节点 hash
    #[default]
    Node,
    /// 指向另一个 tag
    Mirror,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRecord {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: TagKind,
    pub targets: Vec<String>,
}

impl TagRecord {
    pub fn node(name: impl Into<String>, hashes: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind: TagKind::Node,
            targets: hashes,
        }
    }

    pub fn mirror(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TagKind::Mirror,
            targets: vec![target.into()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_and_content_derived() {
        let a = Point::new("hk-1", "sub", vec![Protocol::simple("1.2.3.4", 443)]);
        let b = Point::new("hk-1", "sub", vec![Protocol::simple("1.2.3.4", 443)]);
        let c = Point::new("hk-1", "sub", vec![Protocol::simple("1.2.3.4", 8443)]);
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
        assert_eq!(a.hash.len(), 64);
    }

    #[test]
    fn explicit_hash_is_kept() {
        let mut p = Point::new("n", "", vec![]).with_hash("custom");
        p.ensure_hash();
        assert_eq!(p.hash, "custom");

        let mut q: Point =
            serde_yml::from_str("name: n\nprotocols:\n  - type: direct\n").unwrap();
        assert!(q.hash.is_empty());
        q.ensure_hash();
        assert_eq!(q.hash, q.content_hash());
    }

    #[test]
    fn tag_record_deserialize() {
        let yaml = r#"
- name: hk
  targets: [a, b]
- name: media
  type: mirror
  targets: [hk]
"#;
        let tags: Vec<TagRecord> = serde_yml::from_str(yaml).unwrap();
        assert_eq!(tags[0], TagRecord::node("hk", vec!["a".into(), "b".into()]));
        assert_eq!(tags[1], TagRecord::mirror("media", "hk"));
    }
}
