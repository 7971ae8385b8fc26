use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{ContentLocation, KeywordCheck, PhotoSource, ProviderCore, ProviderKind};
use crate::error::Error;
use crate::network::{ApiRequest, HttpResponse};
use crate::photo::{ImageDescriptor, SizeHints};

pub const SCOPES: [&str; 1] = ["https://www.googleapis.com/auth/photoslibrary.readonly"];
pub const HELP: &str = "Name of an album in your library (shared albums included), \
    or \"latest\" for your most recent photos";

const API_BASE: &str = "https://photoslibrary.googleapis.com/v1";
const MAX_ITEMS: usize = 8000;
const ALBUM_PAGE: u32 = 50;
const SEARCH_PAGE: u32 = 100;
const LATEST: &str = "latest";

#[derive(Debug, Clone)]
pub struct GooglePhotos {
    api_base: String,
}

impl Default for GooglePhotos {
    fn default() -> Self {
        Self {
            api_base: API_BASE.to_string(),
        }
    }
}

/// Lowercased, trimmed album title with one pair of surrounding quotes removed.
pub fn normalize_keyword(raw: &str) -> String {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed);
    unquoted.trim().to_lowercase()
}

/// Body of a `mediaItems:search` request for a keyword.
pub fn search_body(keyword: &str, extras: Option<&Value>) -> Option<Value> {
    if keyword == LATEST {
        return Some(json!({
            "pageSize": SEARCH_PAGE,
            "filters": {"mediaTypeFilter": {"mediaTypes": ["PHOTO"]}},
        }));
    }
    let album = extras?.get("albumId")?.as_str()?;
    Some(json!({"pageSize": SEARCH_PAGE, "albumId": album}))
}

fn dimension(value: Option<&Value>) -> u32 {
    match value {
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as u32,
        _ => 0,
    }
}

/// Converts `mediaItems` entries into descriptors, dropping non-images.
pub fn parse_media_items(items: &[Value]) -> Vec<ImageDescriptor> {
    let mut images = Vec::with_capacity(items.len());
    for entry in items {
        let (Some(id), Some(mime)) = (
            entry.get("id").and_then(Value::as_str),
            entry.get("mimeType").and_then(Value::as_str),
        ) else {
            debug!(?entry, "media item lacks id or mimeType");
            continue;
        };
        if !mime.starts_with("image/") {
            continue;
        }
        let meta = entry.get("mediaMetadata");
        let mut image = ImageDescriptor::new(id, "")
            .with_mime(mime)
            .with_dimensions(
                dimension(meta.and_then(|m| m.get("width"))),
                dimension(meta.and_then(|m| m.get("height"))),
            );
        if let Some(source) = entry.get("productUrl").and_then(Value::as_str) {
            image = image.with_source(source);
        }
        if let Some(name) = entry.get("filename").and_then(Value::as_str) {
            image = image.with_filename(name);
        }
        images.push(image);
    }
    images
}

/// Maps the "API not enabled" answer to its own error kind.
fn check(response: HttpResponse) -> Result<HttpResponse, Error> {
    if response.status == 403 {
        let text = response.text();
        if text.contains("Enable it by visiting") {
            let detail = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or(text);
            return Err(Error::ApiDisabled(detail));
        }
    }
    response.error_for_status()
}

impl GooglePhotos {
    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
        }
    }

    async fn find_album(&self, core: &mut ProviderCore, title: &str) -> Result<Option<Value>, Error> {
        for (endpoint, list_key) in [("albums", "albums"), ("sharedAlbums", "sharedAlbums")] {
            let mut page_token: Option<String> = None;
            loop {
                let mut req = ApiRequest::get(format!("{}/{endpoint}", self.api_base))
                    .query("pageSize", ALBUM_PAGE);
                if let Some(token) = &page_token {
                    req = req.query("pageToken", token);
                }
                let data: Value = check(core.request(req).await?)?.json()?;
                let albums = data[list_key].as_array().cloned().unwrap_or_default();
                for album in &albums {
                    let Some(name) = album["title"].as_str() else {
                        continue;
                    };
                    if normalize_keyword(name) == title {
                        return Ok(Some(json!({
                            "albumId": album["id"],
                            "sourceUrl": album["productUrl"],
                            "albumName": name,
                        })));
                    }
                }
                match data["nextPageToken"].as_str() {
                    Some(token) => page_token = Some(token.to_string()),
                    None => break,
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl PhotoSource for GooglePhotos {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GooglePhotos
    }

    async fn validate_keyword(
        &self,
        core: &mut ProviderCore,
        keyword: &str,
    ) -> Result<KeywordCheck, Error> {
        let keyword = normalize_keyword(keyword);
        if keyword.is_empty() {
            return Ok(KeywordCheck::Reject("Cannot use blank album name".to_string()));
        }
        if keyword == LATEST {
            return Ok(KeywordCheck::Accept {
                keyword,
                extras: None,
            });
        }
        match self.find_album(core, &keyword).await? {
            Some(extras) => Ok(KeywordCheck::Accept {
                keyword,
                extras: Some(extras),
            }),
            None => Ok(KeywordCheck::Reject(format!("No such album \"{keyword}\""))),
        }
    }

    async fn images_for(
        &self,
        core: &mut ProviderCore,
        keyword: &str,
    ) -> Result<Vec<ImageDescriptor>, Error> {
        let mut extras = core.extras_for(keyword);
        if extras.is_none() && keyword != LATEST {
            // Keywords imported without an album lookup resolve here once.
            extras = self.find_album(core, keyword).await?;
            if let Some(found) = &extras {
                core.state()
                    .update(|s| s.extras.insert(keyword.to_string(), found.clone()))
                    .map_err(|err| Error::FailedSaving(format!("{err:#}")))?;
            }
        }
        let Some(mut body) = search_body(keyword, extras.as_ref()) else {
            return Err(Error::Unknown(format!(
                "Unable to get photos using keyword \"{keyword}\""
            )));
        };
        let url = format!("{}/mediaItems:search", self.api_base);
        let mut items: Vec<Value> = Vec::new();
        while items.len() < MAX_ITEMS {
            let response = check(core.request(ApiRequest::post_json(url.clone(), body.clone())).await?);
            let data: Value = match response {
                Ok(response) => response.json()?,
                Err(err @ Error::ApiDisabled(_)) => return Err(err),
                Err(err) if items.is_empty() => return Err(err),
                Err(err) => {
                    warn!(keyword, error = %err, "stopping media search early");
                    break;
                }
            };
            let Some(page) = data["mediaItems"].as_array() else {
                break;
            };
            items.extend(page.iter().cloned());
            match data["nextPageToken"].as_str() {
                Some(token) => body["pageToken"] = Value::String(token.to_string()),
                None => break,
            }
        }
        items.truncate(MAX_ITEMS);
        Ok(parse_media_items(&items))
    }

    async fn content_location(
        &self,
        core: &mut ProviderCore,
        image: &ImageDescriptor,
        hints: SizeHints,
    ) -> Result<ContentLocation, Error> {
        let req = ApiRequest::get(format!("{}/mediaItems/{}", self.api_base, image.id));
        let data: Value = check(core.request(req).await?)?.json()?;
        let Some(base) = data["baseUrl"].as_str() else {
            return Err(Error::Unknown("media item has no baseUrl".to_string()));
        };
        Ok(ContentLocation::Remote(ApiRequest::get(format!(
            "{base}=w{}-h{}",
            hints.size.width, hints.size.height
        ))))
    }

    fn source_url(&self, core: &ProviderCore, keyword: &str) -> Option<String> {
        if keyword == LATEST {
            return Some("https://photos.google.com/".to_string());
        }
        core.extras_for(keyword)?
            .get("sourceUrl")?
            .as_str()
            .map(str::to_string)
    }

    async fn nothing_found(&self, core: &mut ProviderCore) -> String {
        let probe = ApiRequest::get(format!("{}/albums", self.api_base)).query("pageSize", 1);
        match core.request(probe).await.and_then(check) {
            Err(Error::ApiDisabled(_)) => "\"Photos Library API\" is not enabled on\n\
                https://console.developers.google.com"
                .to_string(),
            _ => "No (new) images could be found.\nCheck spelling or make sure you have added albums"
                .to_string(),
        }
    }
}
