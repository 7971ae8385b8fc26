use async_trait::async_trait;
use url::Url;

use super::{ContentLocation, KeywordCheck, PhotoSource, ProviderCore, ProviderKind};
use crate::error::Error;
use crate::network::ApiRequest;
use crate::photo::{ImageDescriptor, SizeHints};

pub const HELP: &str = "Each item is a URL that should return a single image. The URL may \
    contain the terms \"{width}\" and/or \"{height}\" which will be replaced by numbers \
    describing the size of the display.";

/// Each keyword is a URL template serving one image.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleUrl;

pub fn expand_template(template: &str, hints: SizeHints) -> String {
    template
        .replace("{width}", &hints.size.width.to_string())
        .replace("{height}", &hints.size.height.to_string())
}

#[async_trait]
impl PhotoSource for SimpleUrl {
    fn kind(&self) -> ProviderKind {
        ProviderKind::SimpleUrl
    }

    async fn validate_keyword(
        &self,
        _core: &mut ProviderCore,
        keyword: &str,
    ) -> Result<KeywordCheck, Error> {
        let probe = keyword.replace("{width}", "1").replace("{height}", "1");
        match Url::parse(&probe) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(KeywordCheck::Accept {
                keyword: keyword.to_string(),
                extras: None,
            }),
            _ => Ok(KeywordCheck::Reject(format!(
                "\"{keyword}\" is not an http(s) URL"
            ))),
        }
    }

    async fn images_for(
        &self,
        _core: &mut ProviderCore,
        keyword: &str,
    ) -> Result<Vec<ImageDescriptor>, Error> {
        Ok(vec![
            ImageDescriptor::new(keyword, keyword)
                .with_source(keyword)
                .uncacheable(),
        ])
    }

    async fn content_location(
        &self,
        _core: &mut ProviderCore,
        image: &ImageDescriptor,
        hints: SizeHints,
    ) -> Result<ContentLocation, Error> {
        Ok(ContentLocation::Remote(ApiRequest::get(expand_template(
            &image.url, hints,
        ))))
    }

    fn source_url(&self, _core: &ProviderCore, keyword: &str) -> Option<String> {
        Some(keyword.to_string())
    }
}
