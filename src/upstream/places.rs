//! Places adapters (Google Places web service).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::{classify_places_status, classify_transport};
use super::{Upstream, UpstreamError};
use crate::budget::Service;
use crate::cache::{autocomplete_key, place_key, CacheKey, KeyClass};
use crate::trip::PlaceRecord;

/// Lookup for one location, optionally scoped to a city.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceQuery {
    pub location: String,
    pub region_hint: Option<String>,
}

impl PlaceQuery {
    pub fn new(location: impl Into<String>, region_hint: Option<&str>) -> Self {
        Self {
            location: location.into(),
            region_hint: region_hint.map(str::to_string),
        }
    }

    fn text(&self) -> String {
        match self.region_hint.as_deref() {
            Some(region) if !region.trim().is_empty() => format!("{}, {}", self.location, region),
            _ => self.location.clone(),
        }
    }
}

/// City autocomplete query.
#[derive(Debug, Clone, PartialEq)]
pub struct AutocompleteQuery {
    pub input: String,
    pub limit: usize,
}

/// One autocomplete suggestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaceSuggestion {
    pub place_id: Option<String>,
    pub description: String,
    pub main_text: String,
    pub secondary_text: String,
}

#[derive(Deserialize)]
struct TextSearchResponse {
    status: String,
    error_message: Option<String>,
    #[serde(default)]
    results: Vec<TextSearchResult>,
}

#[derive(Deserialize)]
struct TextSearchResult {
    place_id: Option<String>,
    name: Option<String>,
    formatted_address: Option<String>,
    rating: Option<f64>,
    geometry: Option<Geometry>,
    #[serde(default)]
    types: Vec<String>,
    #[serde(default)]
    photos: Vec<Photo>,
}

#[derive(Deserialize)]
struct Geometry {
    location: Option<LatLng>,
}

#[derive(Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

#[derive(Deserialize)]
struct Photo {
    photo_reference: Option<String>,
}

#[derive(Deserialize)]
struct AutocompleteResponse {
    status: String,
    error_message: Option<String>,
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Deserialize)]
struct Prediction {
    place_id: Option<String>,
    #[serde(default)]
    description: String,
    structured_formatting: Option<StructuredFormatting>,
}

#[derive(Deserialize)]
struct StructuredFormatting {
    #[serde(default)]
    main_text: String,
    #[serde(default)]
    secondary_text: String,
}

/// Parse a text search body into the best match, keeping at most
/// `max_photos` photo references.
pub(crate) fn parse_text_search(
    body: &str,
    fallback_name: &str,
    max_photos: usize,
) -> Result<Option<PlaceRecord>, UpstreamError> {
    let response: TextSearchResponse = serde_json::from_str(body)
        .map_err(|e| UpstreamError::malformed(format!("unparseable places response: {}", e)))?;
    classify_places_status(&response.status, response.error_message.as_deref())?;

    Ok(response.results.into_iter().next().map(|place| {
        let location = place.geometry.and_then(|g| g.location);
        PlaceRecord {
            place_id: place.place_id,
            name: place.name.unwrap_or_else(|| fallback_name.to_string()),
            address: place.formatted_address,
            rating: place.rating,
            photo_refs: place
                .photos
                .into_iter()
                .filter_map(|p| p.photo_reference)
                .take(max_photos)
                .collect(),
            lat: location.as_ref().map(|l| l.lat),
            lng: location.as_ref().map(|l| l.lng),
            types: place.types,
        }
    }))
}

pub(crate) fn parse_autocomplete(
    body: &str,
    limit: usize,
) -> Result<Vec<PlaceSuggestion>, UpstreamError> {
    let response: AutocompleteResponse = serde_json::from_str(body).map_err(|e| {
        UpstreamError::malformed(format!("unparseable autocomplete response: {}", e))
    })?;
    classify_places_status(&response.status, response.error_message.as_deref())?;

    Ok(response
        .predictions
        .into_iter()
        .take(limit)
        .map(|p| {
            let (main_text, secondary_text) = p
                .structured_formatting
                .map(|f| (f.main_text, f.secondary_text))
                .unwrap_or_default();
            PlaceSuggestion {
                place_id: p.place_id,
                description: p.description,
                main_text,
                secondary_text,
            }
        })
        .collect())
}

#[derive(Clone)]
struct PlacesHttp {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl PlacesHttp {
    fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<String, UpstreamError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| UpstreamError::unauthorized("places API key is not configured"))?;

        let response = self
            .http
            .get(format!("{}/{}", self.base_url, path))
            .query(query)
            .query(&[("key", api_key)])
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| classify_transport(&e))?;
        if !status.is_success() {
            return Err(UpstreamError::from_http(status.as_u16(), &body));
        }
        Ok(body)
    }
}

/// Text search lookup for a single location.
pub struct GooglePlacesClient {
    inner: PlacesHttp,
    max_photos: usize,
}

impl GooglePlacesClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, max_photos: usize) -> Self {
        Self {
            inner: PlacesHttp::new(base_url.into(), api_key),
            max_photos,
        }
    }
}

#[async_trait]
impl Upstream for GooglePlacesClient {
    type Params = PlaceQuery;
    type Output = Option<PlaceRecord>;

    fn service(&self) -> Service {
        Service::Places
    }

    fn key_class(&self) -> KeyClass {
        KeyClass::Place
    }

    fn cache_key(&self, params: &PlaceQuery) -> CacheKey {
        place_key(&params.location, params.region_hint.as_deref())
    }

    fn output_class(&self, output: &Option<PlaceRecord>) -> KeyClass {
        match output {
            Some(_) => KeyClass::Place,
            None => KeyClass::Negative,
        }
    }

    async fn call(&self, params: &PlaceQuery) -> Result<Option<PlaceRecord>, UpstreamError> {
        let text = params.text();
        let body = self
            .inner
            .get("textsearch/json", &[("query", text.as_str())])
            .await?;
        parse_text_search(&body, &params.location, self.max_photos)
    }
}

/// City autocomplete.
pub struct GoogleAutocompleteClient {
    inner: PlacesHttp,
}

impl GoogleAutocompleteClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            inner: PlacesHttp::new(base_url.into(), api_key),
        }
    }
}

#[async_trait]
impl Upstream for GoogleAutocompleteClient {
    type Params = AutocompleteQuery;
    type Output = Vec<PlaceSuggestion>;

    fn service(&self) -> Service {
        Service::Places
    }

    fn key_class(&self) -> KeyClass {
        KeyClass::Autocomplete
    }

    fn cache_key(&self, params: &AutocompleteQuery) -> CacheKey {
        autocomplete_key(&params.input, params.limit)
    }

    async fn call(&self, params: &AutocompleteQuery) -> Result<Vec<PlaceSuggestion>, UpstreamError> {
        let body = self
            .inner
            .get(
                "autocomplete/json",
                &[
                    ("input", params.input.as_str()),
                    ("types", "(cities)"),
                    ("language", "en"),
                ],
            )
            .await?;
        parse_autocomplete(&body, params.limit)
    }
}
