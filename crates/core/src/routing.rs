//! Route table: which caching strategy answers which request.
//!
//! Route selection is a pure function of the request and the table, so the
//! whole policy can be tested without a store or a network.

use regex::Regex;
use url::Url;

use crate::Error;
use crate::config::OfflineConfig;
use crate::request::Request;
use crate::url::same_origin;

pub const BUCKET_PAGES: &str = "pages";
pub const BUCKET_STATIC: &str = "static-resources";
pub const BUCKET_IMAGES: &str = "images";
pub const BUCKET_FONT_STYLESHEETS: &str = "google-fonts-stylesheets";
pub const BUCKET_FONT_FILES: &str = "google-fonts-webfonts";

/// Expiration bounds for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiration {
    pub max_entries: usize,
    pub max_age_secs: u64,
}

impl Expiration {
    pub fn max_age_ms(&self) -> i64 {
        i64::try_from(self.max_age_secs.saturating_mul(1000)).unwrap_or(i64::MAX)
    }
}

/// How a matched request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Cache, else network with a runtime copy; documents fall back to the
    /// offline page when the network is gone.
    CacheFirst,
    /// Cached copy now, refreshed in the background.
    StaleWhileRevalidate,
    /// Cache unless older than the bound, else network; bucket trimmed after
    /// every insert.
    CacheFirstExpiring(Expiration),
}

#[derive(Debug, Clone)]
enum Matcher {
    /// Any request to exactly this origin.
    Origin(Url),
    /// Same-origin request whose path matches.
    SameOriginPath(Regex),
    /// Any same-origin request.
    SameOrigin,
}

/// One entry of the route table.
#[derive(Debug, Clone)]
pub struct Route {
    /// Bucket the route's runtime entries are tagged with.
    pub bucket: &'static str,
    pub strategy: Strategy,
    /// Status codes worth storing.
    pub cacheable_statuses: Vec<u16>,
    matcher: Matcher,
}

impl Route {
    pub fn is_cacheable(&self, status: u16) -> bool {
        self.cacheable_statuses.contains(&status)
    }

    pub fn expiration(&self) -> Option<Expiration> {
        match self.strategy {
            Strategy::CacheFirstExpiring(exp) => Some(exp),
            _ => None,
        }
    }

    fn matches(&self, origin: &Url, request: &Request) -> bool {
        match &self.matcher {
            Matcher::Origin(host) => same_origin(host, &request.url),
            Matcher::SameOriginPath(re) => same_origin(origin, &request.url) && re.is_match(request.url.path()),
            Matcher::SameOrigin => same_origin(origin, &request.url),
        }
    }
}

/// Why a request was left to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    /// The worker is not serving yet.
    NotActive,
    /// Foreign origin with no route.
    CrossOrigin,
}

/// Outcome of route selection.
#[derive(Debug, Clone, Copy)]
pub enum Decision<'a> {
    Passthrough(PassReason),
    Handle(&'a Route),
}

/// Ordered route table, first match wins.
#[derive(Debug, Clone)]
pub struct RouteTable {
    origin: Url,
    routes: Vec<Route>,
}

impl RouteTable {
    /// Build the standard table for the calculator app.
    ///
    /// Order: font stylesheets, font files, static css/js, images, then
    /// every other same-origin request.
    pub fn from_config(config: &OfflineConfig) -> Result<Self, Error> {
        let origin = config.origin_url().map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let font_css = Url::parse(&config.font_stylesheet_origin).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let font_files = Url::parse(&config.font_file_origin).map_err(|e| Error::InvalidUrl(e.to_string()))?;

        let static_re = Regex::new(r"(?i)\.(?:css|js)$").map_err(|e| Error::InvalidInput(e.to_string()))?;
        let image_re =
            Regex::new(r"(?i)\.(?:png|jpg|jpeg|svg|gif|ico)$").map_err(|e| Error::InvalidInput(e.to_string()))?;

        let routes = vec![
            Route {
                bucket: BUCKET_FONT_STYLESHEETS,
                strategy: Strategy::StaleWhileRevalidate,
                cacheable_statuses: vec![200],
                matcher: Matcher::Origin(font_css),
            },
            Route {
                bucket: BUCKET_FONT_FILES,
                strategy: Strategy::CacheFirstExpiring(Expiration {
                    max_entries: config.font_max_entries,
                    max_age_secs: config.font_max_age_secs,
                }),
                cacheable_statuses: vec![0, 200],
                matcher: Matcher::Origin(font_files),
            },
            Route {
                bucket: BUCKET_STATIC,
                strategy: Strategy::StaleWhileRevalidate,
                cacheable_statuses: vec![200],
                matcher: Matcher::SameOriginPath(static_re),
            },
            Route {
                bucket: BUCKET_IMAGES,
                strategy: Strategy::CacheFirstExpiring(Expiration {
                    max_entries: config.image_max_entries,
                    max_age_secs: config.image_max_age_secs,
                }),
                cacheable_statuses: vec![200],
                matcher: Matcher::SameOriginPath(image_re),
            },
            Route {
                bucket: BUCKET_PAGES,
                strategy: Strategy::CacheFirst,
                cacheable_statuses: vec![200],
                matcher: Matcher::SameOrigin,
            },
        ];

        Ok(Self { origin, routes })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Route for a bucket name, if any.
    pub fn route_for_bucket(&self, bucket: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.bucket == bucket)
    }

    /// Pick the route answering `request`.
    pub fn select(&self, request: &Request) -> Decision<'_> {
        match self.routes.iter().find(|r| r.matches(&self.origin, request)) {
            Some(route) => Decision::Handle(route),
            None => Decision::Passthrough(PassReason::CrossOrigin),
        }
    }
}
