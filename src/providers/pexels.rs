use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{ContentLocation, PhotoSource, ProviderCore, ProviderKind};
use crate::error::Error;
use crate::network::ApiRequest;
use crate::photo::{ImageDescriptor, SizeHints};

pub const HELP: &str = "Type in a query for the kind of images you want. \
    Can also use \"curated\" for a curated selection";
pub const AUTH_KEY: &str = "authkey";

const API_BASE: &str = "https://api.pexels.com/v1";
const MAX_ITEMS: usize = 1000;
const PER_PAGE: u32 = 80;

pub fn config_fields() -> Value {
    json!({
        AUTH_KEY: {
            "type": "STR",
            "name": "API key",
            "description": "A pexels.com API key in order to access their API endpoints",
        }
    })
}

#[derive(Debug, Clone)]
pub struct Pexels {
    api_base: String,
}

impl Default for Pexels {
    fn default() -> Self {
        Self {
            api_base: API_BASE.to_string(),
        }
    }
}

impl Pexels {
    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
        }
    }

    /// First page request for a keyword; later pages follow `next_page`.
    pub fn first_page(&self, keyword: &str) -> ApiRequest {
        if keyword == "curated" {
            ApiRequest::get(format!("{}/curated", self.api_base)).query("per_page", PER_PAGE)
        } else {
            ApiRequest::get(format!("{}/search", self.api_base))
                .query("per_page", PER_PAGE)
                .query("query", keyword)
        }
    }
}

pub fn parse_photos(photos: &[Value]) -> Vec<ImageDescriptor> {
    photos
        .iter()
        .filter_map(|entry| {
            let id = match &entry["id"] {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                _ => return None,
            };
            let Some(url) = entry["src"]["original"].as_str() else {
                debug!(id, "photo lacks src.original");
                return None;
            };
            let mut image = ImageDescriptor::new(id, url).with_dimensions(
                entry["width"].as_u64().unwrap_or(0) as u32,
                entry["height"].as_u64().unwrap_or(0) as u32,
            );
            if let Some(page) = entry["url"].as_str() {
                image = image.with_source(page);
            }
            Some(image)
        })
        .collect()
}

/// Download URL asking the CDN for a crop of the recommended size.
pub fn sized_url(original: &str, hints: SizeHints) -> String {
    format!(
        "{original}?auto=compress&cs=tinysrgb&fit=crop&h={}&w={}",
        hints.size.height, hints.size.width
    )
}

#[async_trait]
impl PhotoSource for Pexels {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Pexels
    }

    fn needs_config(&self) -> bool {
        true
    }

    async fn images_for(
        &self,
        core: &mut ProviderCore,
        keyword: &str,
    ) -> Result<Vec<ImageDescriptor>, Error> {
        let key = core.config_value(AUTH_KEY).unwrap_or_default();
        let mut req = self.first_page(keyword);
        let mut photos: Vec<Value> = Vec::new();
        while photos.len() < MAX_ITEMS {
            let response = core.request(req.header("Authorization", key.clone())).await?;
            if !response.is_success() {
                if photos.is_empty() {
                    return Err(Error::Http {
                        status: response.status,
                        message: response.text(),
                    });
                }
                warn!(keyword, status = response.status, "stopping photo listing early");
                break;
            }
            let data: Value = response.json()?;
            let Some(page) = data["photos"].as_array() else {
                break;
            };
            photos.extend(page.iter().cloned());
            match data["next_page"].as_str() {
                Some(next) => req = ApiRequest::get(next),
                None => break,
            }
        }
        photos.truncate(MAX_ITEMS);
        Ok(parse_photos(&photos))
    }

    async fn content_location(
        &self,
        _core: &mut ProviderCore,
        image: &ImageDescriptor,
        hints: SizeHints,
    ) -> Result<ContentLocation, Error> {
        Ok(ContentLocation::Remote(ApiRequest::get(sized_url(
            &image.url, hints,
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photo::Dimensions;

    #[test]
    fn curated_and_search_use_different_endpoints() {
        let pexels = Pexels::with_api_base("http://api");
        let curated = pexels.first_page("curated");
        assert_eq!(curated.url, "http://api/curated");
        let search = pexels.first_page("sunsets");
        assert_eq!(search.url, "http://api/search");
        assert!(search.query.contains(&("query".to_string(), "sunsets".to_string())));
        assert!(search.query.contains(&("per_page".to_string(), "80".to_string())));
    }

    #[test]
    fn photos_parse_into_descriptors() {
        let photos = vec![
            json!({"id": 42, "url": "https://pexels.com/photo/42", "width": 6000, "height": 4000,
                   "src": {"original": "https://images.pexels.com/42.jpeg"}}),
            json!({"id": 43}),
        ];
        let parsed = parse_photos(&photos);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, "42");
        assert_eq!(parsed[0].url, "https://images.pexels.com/42.jpeg");
        assert_eq!(parsed[0].dimensions, Some(Dimensions::new(6000, 4000)));
    }

    #[test]
    fn sized_url_requests_crop() {
        let hints = SizeHints {
            size: Dimensions::new(1920, 1280),
            display: Dimensions::new(1920, 1080),
        };
        assert_eq!(
            sized_url("https://x/1.jpeg", hints),
            "https://x/1.jpeg?auto=compress&cs=tinysrgb&fit=crop&h=1280&w=1920"
        );
    }
}
