use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{ContentLocation, KeywordCheck, PhotoSource, ProviderCore, ProviderKind, ProviderState};
use crate::error::Error;
use crate::photo::{ImageDescriptor, SizeHints, measure, mime_from_extension};

pub const HELP: &str = "Place photo albums in /photoframe/{album_name} on your usb-device.\n\
    Use the {album_name} as keyword (CasE-seNsitiVe!).\n\
    If you want to display all albums simply write 'ALLALBUMS' as keyword.\n\
    Alternatively, place images directly inside the '/photoframe/' directory.";

/// Stands for every album directory.
pub const ALL_ALBUMS: &str = "ALLALBUMS";
/// Stands for images placed directly in the base directory.
pub const BASE_IMAGES: &str = "_PHOTOFRAME_";

/// Photos on mounted removable storage, one album per subdirectory.
#[derive(Debug, Clone)]
pub struct UsbPhotos {
    base: PathBuf,
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

fn is_image(path: &Path) -> bool {
    path.is_file() && !is_hidden(path) && mime_from_extension(path).is_some()
}

fn images_below(dir: &Path, max_depth: usize) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.into_path())
        .filter(|path| is_image(path))
        .collect();
    found.sort();
    found
}

fn describe(path: &Path) -> ImageDescriptor {
    let text = path.to_string_lossy().into_owned();
    let mut image = ImageDescriptor::new(text.clone(), text);
    if let Some(mime) = mime_from_extension(path) {
        image = image.with_mime(mime);
    }
    if let Some(dims) = measure(path) {
        image = image.with_dimensions(dims.width, dims.height);
    }
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        image = image.with_filename(name);
    }
    image
}

impl UsbPhotos {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn album_names(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.base) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir() && !is_hidden(p))
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();
        names.sort();
        names
    }

    pub fn base_images(&self) -> Vec<PathBuf> {
        images_below(&self.base, 1)
    }

    /// Image files a keyword refers to.
    pub fn files_for(&self, keyword: &str) -> Vec<PathBuf> {
        match keyword {
            BASE_IMAGES => self.base_images(),
            ALL_ALBUMS => self
                .album_names()
                .iter()
                .flat_map(|album| images_below(&self.base.join(album), usize::MAX))
                .collect(),
            album => images_below(&self.base.join(album), usize::MAX),
        }
    }

    fn keyword_valid(&self, keyword: &str, albums: &[String], has_base_images: bool) -> bool {
        match keyword {
            ALL_ALBUMS => true,
            BASE_IMAGES => has_base_images,
            album => albums.iter().any(|a| a == album),
        }
    }
}

#[async_trait]
impl PhotoSource for UsbPhotos {
    fn kind(&self) -> ProviderKind {
        ProviderKind::UsbPhotos
    }

    fn precheck(&self, core: &mut ProviderCore) -> Option<ProviderState> {
        if !self.base.is_dir() {
            return Some(ProviderState::NotConnected);
        }
        let albums = self.album_names();
        let has_base_images = !self.base_images().is_empty();
        if albums.is_empty() && !has_base_images {
            return Some(ProviderState::NoImages);
        }

        let keywords = core.keywords();
        for (index, keyword) in keywords.iter().enumerate().rev() {
            if !self.keyword_valid(keyword, &albums, has_base_images) {
                info!(keyword, "removing keyword without matching album");
                if let Err(err) = core.state().update(|s| s.remove_keyword_at(index)) {
                    warn!(error = ?err, "failed to drop stale keyword");
                }
            }
        }
        if core.keywords().is_empty() && has_base_images {
            debug!("using images in the base directory");
            if let Err(err) = core.state().update(|s| s.push_keyword(BASE_IMAGES, None)) {
                warn!(error = ?err, "failed to add base directory keyword");
            }
        }
        None
    }

    fn explain(&self, state: ProviderState) -> Option<String> {
        match state {
            ProviderState::NotConnected => {
                Some("no storage device (e.g. USB-stick) detected!".to_string())
            }
            ProviderState::NoImages => Some(
                "no images could be found!\nPlace images and/or albums inside a \
                 '/photoframe'-directory on your storage device"
                    .to_string(),
            ),
            _ => None,
        }
    }

    async fn validate_keyword(
        &self,
        _core: &mut ProviderCore,
        keyword: &str,
    ) -> Result<KeywordCheck, Error> {
        let albums = self.album_names();
        let has_base_images = !self.base_images().is_empty();
        if self.keyword_valid(keyword, &albums, has_base_images) {
            Ok(KeywordCheck::Accept {
                keyword: keyword.to_string(),
                extras: None,
            })
        } else {
            Ok(KeywordCheck::Reject(format!("No such album \"{keyword}\"")))
        }
    }

    async fn images_for(
        &self,
        _core: &mut ProviderCore,
        keyword: &str,
    ) -> Result<Vec<ImageDescriptor>, Error> {
        let this = self.clone();
        let keyword = keyword.to_string();
        tokio::task::spawn_blocking(move || {
            this.files_for(&keyword).iter().map(|p| describe(p)).collect()
        })
        .await
        .map_err(|err| Error::Unknown(err.to_string()))
    }

    async fn content_location(
        &self,
        _core: &mut ProviderCore,
        image: &ImageDescriptor,
        _hints: SizeHints,
    ) -> Result<ContentLocation, Error> {
        let path = PathBuf::from(&image.url);
        if !path.is_file() {
            return Err(Error::Unknown(format!("{} is no longer available", image.url)));
        }
        Ok(ContentLocation::Local(path))
    }

    fn source_url(&self, _core: &ProviderCore, keyword: &str) -> Option<String> {
        match keyword {
            BASE_IMAGES | ALL_ALBUMS => Some(self.base.display().to_string()),
            album => Some(self.base.join(album).display().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"not really a jpeg").unwrap();
    }

    #[test]
    fn albums_and_base_images_are_listed() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("summer/a.jpg"));
        touch(&dir.path().join("summer/nested/b.png"));
        touch(&dir.path().join("winter/c.jpeg"));
        touch(&dir.path().join("loose.jpg"));
        touch(&dir.path().join("notes.txt"));
        fs::create_dir_all(dir.path().join(".hidden")).unwrap();

        let usb = UsbPhotos::new(dir.path());
        assert_eq!(usb.album_names(), vec!["summer", "winter"]);
        assert_eq!(usb.base_images(), vec![dir.path().join("loose.jpg")]);
        assert_eq!(usb.files_for("summer").len(), 2);
        assert_eq!(usb.files_for(ALL_ALBUMS).len(), 3);
        assert_eq!(usb.files_for(BASE_IMAGES).len(), 1);
    }

    #[test]
    fn keyword_validity() {
        let usb = UsbPhotos::new("/nonexistent");
        let albums = vec!["summer".to_string()];
        assert!(usb.keyword_valid("summer", &albums, false));
        assert!(!usb.keyword_valid("Summer", &albums, false));
        assert!(usb.keyword_valid(ALL_ALBUMS, &albums, false));
        assert!(!usb.keyword_valid(BASE_IMAGES, &albums, false));
        assert!(usb.keyword_valid(BASE_IMAGES, &albums, true));
    }
}
