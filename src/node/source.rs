use std::collections::HashMap;
use std::sync::RwLock;

use super::{Point, TagRecord};

/// 节点与 tag 的只读来源
pub trait NodeSource: Send + Sync {
    fn point(&self, hash: &str) -> Option<Point>;
    fn tag(&self, name: &str) -> Option<TagRecord>;
}

/// 内存节点表，由配置构建，可在运行时增删
#[derive(Default)]
pub struct MemoryNodes {
    points: RwLock<HashMap<String, Point>>,
    tags: RwLock<HashMap<String, TagRecord>>,
}

impl MemoryNodes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(points: Vec<Point>, tags: Vec<TagRecord>) -> Self {
        let nodes = Self::new();
        for point in points {
            nodes.upsert_point(point);
        }
        for tag in tags {
            nodes.upsert_tag(tag);
        }
        nodes
    }

    /// 插入或替换节点，返回被替换的旧配置
    pub fn upsert_point(&self, mut point: Point) -> Option<Point> {
        point.ensure_hash();
        let mut points = self.points.write().unwrap_or_else(|p| p.into_inner());
        points.insert(point.hash.clone(), point)
    }

    pub fn remove_point(&self, hash: &str) -> Option<Point> {
        let mut points = self.points.write().unwrap_or_else(|p| p.into_inner());
        points.remove(hash)
    }

    pub fn upsert_tag(&self, tag: TagRecord) -> Option<TagRecord> {
        let mut tags = self.tags.write().unwrap_or_else(|p| p.into_inner());
        tags.insert(tag.name.clone(), tag)
    }

    pub fn remove_tag(&self, name: &str) -> Option<TagRecord> {
        let mut tags = self.tags.write().unwrap_or_else(|p| p.into_inner());
        tags.remove(name)
    }

    pub fn hashes(&self) -> Vec<String> {
        let points = self.points.read().unwrap_or_else(|p| p.into_inner());
        points.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.points.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NodeSource for MemoryNodes {
    fn point(&self, hash: &str) -> Option<Point> {
        let points = self.points.read().unwrap_or_else(|p| p.into_inner());
        points.get(hash).cloned()
    }

    fn tag(&self, name: &str) -> Option<TagRecord> {
        let tags = self.tags.read().unwrap_or_else(|p| p.into_inner());
        tags.get(name).cloned()
    }
}
