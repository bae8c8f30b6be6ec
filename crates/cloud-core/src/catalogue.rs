//! Image catalogue: a pure, in-process lookup against statically configured
//! images, no I/O.

use std::collections::HashMap;

use crate::error::EngineError;
use crate::model::{Image, InstanceKind};

#[derive(Debug, Clone, Default)]
pub struct ImageCatalogue {
    images: HashMap<(InstanceKind, String), Image>,
}

impl ImageCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: InstanceKind, image: Image) {
        self.images.insert((kind, image.id.clone()), image);
    }

    pub fn get(&self, kind: InstanceKind, image_id: &str) -> Result<&Image, EngineError> {
        self.images
            .get(&(kind, image_id.to_string()))
            .ok_or_else(|| EngineError::ImageNotFound(format!("{kind:?}/{image_id}")))
    }

    pub fn list(&self, kind: InstanceKind) -> impl Iterator<Item = &Image> {
        self.images.iter().filter(move |((k, _), _)| *k == kind).map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DiskFormat, Specs};

    fn alpine() -> Image {
        Image {
            id: "alpine-3.18".into(),
            disk_file: "alpine-3.18.tar.gz".into(),
            disk_format: DiskFormat::TarGz,
            disk_sha256: Some("deadbeef".into()),
            fallback_url: Some("https://images.example/alpine-3.18.tar.gz".into()),
            specs: Specs { cores: 1, memory_mb: 512, swap_mb: 512, disk_space_gb: 8 },
            wake_on_request: false,
        }
    }

    #[test]
    fn lookup_hit() {
        let mut cat = ImageCatalogue::new();
        cat.insert(InstanceKind::Container, alpine());
        let img = cat.get(InstanceKind::Container, "alpine-3.18").unwrap();
        assert_eq!(img.disk_file, "alpine-3.18.tar.gz");
    }

    #[test]
    fn lookup_miss_is_image_not_found() {
        let cat = ImageCatalogue::new();
        let err = cat.get(InstanceKind::Container, "nonexistent").unwrap_err();
        assert!(matches!(err, EngineError::ImageNotFound(_)));
    }

    #[test]
    fn lookup_is_kind_scoped() {
        let mut cat = ImageCatalogue::new();
        cat.insert(InstanceKind::Container, alpine());
        assert!(cat.get(InstanceKind::Vm, "alpine-3.18").is_err());
    }
}
