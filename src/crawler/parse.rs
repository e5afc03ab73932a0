//! Marketplace payload extraction
//!
//! The remote GraphQL responses change shape without notice, so extraction is
//! layered: a primary path targeting the current structure, a legacy path for
//! the previous structure, and a bounded recursive walker that hunts for
//! recognizable objects anywhere in the tree. When the walker also finds
//! nothing, the caller gets a `ParseError` and the task is failed without
//! retries.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::ParseError;
use crate::models::{CalendarDay, ListingRecord, RoomType};

lazy_static! {
    static ref NON_DIGIT: Regex = Regex::new(r"[^\d]").unwrap();
}

/// Maximum recursion depth for the fallback walkers
const MAX_WALK_DEPTH: usize = 10;

/// Listing attributes extractable from a detail payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailAttrs {
    pub name: Option<String>,
    pub room_type: Option<RoomType>,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
}

/// Extract listing entries from a search payload
///
/// Current structure:
/// `data.presentation.staysSearch.results.searchResults[]` with
/// `propertyId` / base64 `demandStayListing.id`, `nameLocalized`,
/// `structuredDisplayPrice.primaryLine` and `demandStayListing` attributes.
pub fn extract_listings(payload: &Value) -> Result<Vec<ListingRecord>, ParseError> {
    let results = payload
        .pointer("/data/presentation/staysSearch/results/searchResults")
        .and_then(Value::as_array);

    let mut listings = Vec::new();
    if let Some(results) = results {
        for result in results {
            if let Some(record) = extract_search_result(result) {
                listings.push(record);
            }
        }
    }

    if listings.is_empty() {
        listings = fallback_listings(payload);
        if !listings.is_empty() {
            debug!(count = listings.len(), "Fallback parser found listings");
        }
    }

    if listings.is_empty() {
        return Err(ParseError::ListingsNotFound);
    }
    Ok(listings)
}

fn extract_search_result(result: &Value) -> Option<ListingRecord> {
    let demand = result.get("demandStayListing").unwrap_or(&Value::Null);
    let coord = demand.pointer("/location/coordinate").unwrap_or(&Value::Null);

    let market_id = result
        .get("propertyId")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| {
            demand
                .get("id")
                .and_then(Value::as_str)
                .and_then(decode_market_id)
        });

    let name = match result.get("nameLocalized") {
        Some(Value::String(s)) => s.clone(),
        Some(obj) => obj
            .get("localizedStringWithTranslationPreference")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        None => String::new(),
    };

    let mut record = ListingRecord {
        market_id: market_id.unwrap_or_default(),
        name,
        room_type: demand
            .get("roomTypeCategory")
            .and_then(Value::as_str)
            .and_then(RoomType::parse),
        latitude: coord.get("latitude").and_then(Value::as_f64),
        longitude: coord.get("longitude").and_then(Value::as_f64),
        price: extract_display_price(result),
        rating: result
            .get("avgRatingLocalized")
            .and_then(Value::as_str)
            .and_then(parse_rating),
        review_count: demand.get("reviewsCount").and_then(Value::as_i64),
    };

    // Previous structure kept everything under a `listing` sub-object
    if record.market_id.is_empty() {
        if let Some(listing) = result.get("listing") {
            record.market_id = json_id(listing.get("id")).unwrap_or_default();
            record.name = listing
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            record.room_type = listing
                .get("roomTypeCategory")
                .and_then(Value::as_str)
                .and_then(RoomType::parse);
            record.latitude = listing.pointer("/coordinate/latitude").and_then(Value::as_f64);
            record.longitude = listing.pointer("/coordinate/longitude").and_then(Value::as_f64);
            record.rating = listing.get("avgRating").and_then(Value::as_f64);
            record.review_count = listing.get("reviewsCount").and_then(Value::as_i64);
            record.price = result
                .pointer("/pricingQuote/price/total/amount")
                .and_then(Value::as_f64)
                .or(record.price);
        }
    }

    if record.market_id.is_empty() {
        None
    } else {
        Some(record)
    }
}

/// Recursive search for listing-shaped objects when the known paths miss
fn fallback_listings(payload: &Value) -> Vec<ListingRecord> {
    let mut found = Vec::new();
    walk(payload, 0, &mut |obj| {
        let has_coord = obj.get("coordinate").is_some() || obj.get("lat").is_some();
        if obj.get("id").is_some() && obj.get("name").is_some() && has_coord {
            let record = ListingRecord {
                market_id: json_id(obj.get("id")).unwrap_or_default(),
                name: obj
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                room_type: obj
                    .get("roomTypeCategory")
                    .or_else(|| obj.get("room_type"))
                    .and_then(Value::as_str)
                    .and_then(RoomType::parse),
                latitude: obj
                    .pointer("/coordinate/latitude")
                    .or_else(|| obj.get("lat"))
                    .and_then(Value::as_f64),
                longitude: obj
                    .pointer("/coordinate/longitude")
                    .or_else(|| obj.get("lng"))
                    .and_then(Value::as_f64),
                price: obj
                    .pointer("/price/amount")
                    .and_then(Value::as_f64)
                    .or_else(|| obj.get("price").and_then(Value::as_f64)),
                rating: obj.get("avgRating").and_then(Value::as_f64),
                review_count: obj.get("reviewsCount").and_then(Value::as_i64),
            };
            if !record.market_id.is_empty() {
                found.push(record);
            }
            false // matched objects are leaves
        } else {
            true
        }
    });
    found
}

/// Extract calendar days from an availability payload
///
/// Current structure:
/// `data.merlin.pdpAvailabilityCalendar.calendarMonths[].days[]` with
/// `calendarDate`, `available`, `price.amount` and `minNights`.
pub fn extract_calendar_days(payload: &Value) -> Result<Vec<CalendarDay>, ParseError> {
    let months = payload
        .pointer("/data/merlin/pdpAvailabilityCalendar/calendarMonths")
        .and_then(Value::as_array);

    let mut days = Vec::new();
    if let Some(months) = months {
        for month in months {
            let Some(month_days) = month.get("days").and_then(Value::as_array) else {
                continue;
            };
            for day in month_days {
                if let Some(parsed) = extract_calendar_day(day) {
                    days.push(parsed);
                }
            }
        }
    }

    if days.is_empty() {
        days = fallback_calendar_days(payload);
        if !days.is_empty() {
            debug!(count = days.len(), "Fallback parser found calendar days");
        }
    }

    if days.is_empty() {
        return Err(ParseError::CalendarNotFound);
    }
    Ok(days)
}

fn extract_calendar_day(day: &Value) -> Option<CalendarDay> {
    let date_str = day.get("calendarDate").and_then(Value::as_str)?;
    let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d").ok()?;
    Some(CalendarDay {
        date,
        available: day.get("available").and_then(Value::as_bool).unwrap_or(false),
        price: day
            .pointer("/price/amount")
            .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(parse_price_str))),
        min_nights: day
            .get("minNights")
            .and_then(Value::as_u64)
            .map(|n| n as u32),
    })
}

fn fallback_calendar_days(payload: &Value) -> Vec<CalendarDay> {
    let mut found = Vec::new();
    walk(payload, 0, &mut |obj| {
        if obj.get("calendarDate").is_some() && obj.get("available").is_some() {
            if let Some(day) = extract_calendar_day(obj) {
                found.push(day);
            }
            false
        } else {
            true
        }
    });
    found
}

/// Extract updated listing attributes from a detail payload
///
/// Detail payloads vary the most across schema versions, so this only uses
/// the walker and takes the first value seen for each attribute.
pub fn extract_detail_attrs(payload: &Value) -> DetailAttrs {
    let mut attrs = DetailAttrs::default();
    walk(payload, 0, &mut |obj| {
        if attrs.room_type.is_none() {
            attrs.room_type = obj
                .get("roomTypeCategory")
                .and_then(Value::as_str)
                .and_then(RoomType::parse);
        }
        if attrs.name.is_none() {
            attrs.name = obj
                .get("listingTitle")
                .or_else(|| obj.get("title"))
                .and_then(Value::as_str)
                .map(String::from);
        }
        if attrs.rating.is_none() {
            attrs.rating = obj
                .get("overallRating")
                .or_else(|| obj.get("avgRating"))
                .and_then(Value::as_f64);
        }
        if attrs.review_count.is_none() {
            attrs.review_count = obj
                .get("overallCount")
                .or_else(|| obj.get("reviewsCount"))
                .and_then(Value::as_i64);
        }
        true
    });
    attrs
}

/// Depth-bounded pre-order walk over every JSON object in the tree
///
/// The visitor returns false to stop descending into a matched object.
fn walk(value: &Value, depth: usize, visit: &mut impl FnMut(&Value) -> bool) {
    if depth > MAX_WALK_DEPTH {
        return;
    }
    match value {
        Value::Object(map) => {
            if visit(value) {
                for child in map.values() {
                    walk(child, depth + 1, visit);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, depth + 1, visit);
            }
        }
        _ => {}
    }
}

/// Decode a base64 market id:
/// `"RGVtYW5kU3RheUxpc3Rpbmc6MTIzNDU2Nzg="` → `"DemandStayListing:12345678"`
/// → `"12345678"`
pub fn decode_market_id(encoded: &str) -> Option<String> {
    if encoded.is_empty() {
        return None;
    }
    let decoded = BASE64.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    Some(match decoded.rsplit_once(':') {
        Some((_, id)) => id.to_string(),
        None => decoded,
    })
}

/// Parse a localized display price: `"₩119,824"` → `119824.0`
pub fn parse_price_str(s: &str) -> Option<f64> {
    let digits = NON_DIGIT.replace_all(s, "");
    if digits.is_empty() {
        return None;
    }
    digits.parse::<f64>().ok()
}

fn extract_display_price(result: &Value) -> Option<f64> {
    let primary = result.pointer("/structuredDisplayPrice/primaryLine")?;
    let price_str = primary
        .get("discountedPrice")
        .or_else(|| primary.get("price"))
        .or_else(|| primary.get("accessibilityLabel"))
        .and_then(Value::as_str)?;
    parse_price_str(price_str)
}

fn parse_rating(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok()
}

/// A market id field may be a string or a bare number
fn json_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Truncated sha256 of a payload, for duplicate-response detection
pub fn payload_hash(payload: &Value) -> String {
    // serde_json maps are ordered, so serialization is canonical
    let raw = payload.to_string();
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_payload() -> Value {
        json!({
            "data": { "presentation": { "staysSearch": { "results": { "searchResults": [
                {
                    "propertyId": "12345",
                    "nameLocalized": { "localizedStringWithTranslationPreference": "한강뷰 아파트" },
                    "avgRatingLocalized": "4.89",
                    "structuredDisplayPrice": { "primaryLine": { "discountedPrice": "₩119,824" } },
                    "demandStayListing": {
                        "roomTypeCategory": "entire_home",
                        "reviewsCount": 120,
                        "location": { "coordinate": { "latitude": 37.55, "longitude": 126.97 } }
                    }
                },
                {
                    "demandStayListing": {
                        "id": "RGVtYW5kU3RheUxpc3Rpbmc6OTg3NjU=",
                        "roomTypeCategory": "private_room",
                        "location": { "coordinate": { "latitude": 37.51, "longitude": 127.02 } }
                    },
                    "structuredDisplayPrice": { "primaryLine": { "price": "₩55,000" } }
                }
            ] } } } }
        })
    }

    #[test]
    fn test_extract_listings_primary_path() {
        let listings = extract_listings(&search_payload()).unwrap();
        assert_eq!(listings.len(), 2);

        assert_eq!(listings[0].market_id, "12345");
        assert_eq!(listings[0].name, "한강뷰 아파트");
        assert_eq!(listings[0].room_type, Some(RoomType::EntireHome));
        assert_eq!(listings[0].price, Some(119_824.0));
        assert_eq!(listings[0].rating, Some(4.89));
        assert_eq!(listings[0].review_count, Some(120));

        // Second entry has only the base64 id
        assert_eq!(listings[1].market_id, "98765");
        assert_eq!(listings[1].price, Some(55_000.0));
    }

    #[test]
    fn test_extract_listings_legacy_shape() {
        let payload = json!({
            "data": { "presentation": { "staysSearch": { "results": { "searchResults": [
                {
                    "listing": {
                        "id": "777",
                        "name": "Old shape",
                        "roomTypeCategory": "hotel",
                        "coordinate": { "latitude": 37.5, "longitude": 127.0 },
                        "avgRating": 4.5,
                        "reviewsCount": 10
                    },
                    "pricingQuote": { "price": { "total": { "amount": 89000.0 } } }
                }
            ] } } } }
        });
        let listings = extract_listings(&payload).unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].market_id, "777");
        assert_eq!(listings[0].room_type, Some(RoomType::Hotel));
        assert_eq!(listings[0].price, Some(89_000.0));
    }

    #[test]
    fn test_extract_listings_fallback_walker() {
        let payload = json!({
            "unexpected": { "nesting": [ {
                "id": 4242,
                "name": "Hidden listing",
                "lat": 37.5,
                "lng": 127.0,
                "price": 70000.0
            } ] }
        });
        let listings = extract_listings(&payload).unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].market_id, "4242");
        assert_eq!(listings[0].price, Some(70_000.0));
    }

    #[test]
    fn test_extract_listings_empty_is_error() {
        let payload = json!({ "data": {} });
        assert!(matches!(
            extract_listings(&payload),
            Err(ParseError::ListingsNotFound)
        ));
    }

    fn calendar_payload() -> Value {
        json!({
            "data": { "merlin": { "pdpAvailabilityCalendar": { "calendarMonths": [
                { "days": [
                    { "calendarDate": "2026-03-10", "available": true,
                      "price": { "amount": 100000.0 }, "minNights": 1 },
                    { "calendarDate": "2026-03-11", "available": false,
                      "price": null, "minNights": 2 }
                ] }
            ] } } }
        })
    }

    #[test]
    fn test_extract_calendar_days() {
        let days = extract_calendar_days(&calendar_payload()).unwrap();
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].date, NaiveDate::from_ymd_opt(2026, 3, 10).unwrap());
        assert!(days[0].available);
        assert_eq!(days[0].price, Some(100_000.0));
        assert!(!days[1].available);
        assert_eq!(days[1].price, None);
        assert_eq!(days[1].min_nights, Some(2));
    }

    #[test]
    fn test_extract_calendar_fallback_walker() {
        let payload = json!({
            "something": [ { "else": {
                "calendarDate": "2026-04-01", "available": true
            } } ]
        });
        let days = extract_calendar_days(&payload).unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].date, NaiveDate::from_ymd_opt(2026, 4, 1).unwrap());
    }

    #[test]
    fn test_extract_calendar_empty_is_error() {
        assert!(matches!(
            extract_calendar_days(&json!({})),
            Err(ParseError::CalendarNotFound)
        ));
    }

    #[test]
    fn test_decode_market_id() {
        assert_eq!(
            decode_market_id("RGVtYW5kU3RheUxpc3Rpbmc6OTg3NjU="),
            Some("98765".to_string())
        );
        assert_eq!(decode_market_id(""), None);
        assert_eq!(decode_market_id("not base64!!"), None);
    }

    #[test]
    fn test_parse_price_str() {
        assert_eq!(parse_price_str("₩119,824"), Some(119_824.0));
        assert_eq!(parse_price_str("119824"), Some(119_824.0));
        assert_eq!(parse_price_str("가격 미정"), None);
        assert_eq!(parse_price_str(""), None);
    }

    #[test]
    fn test_extract_detail_attrs() {
        let payload = json!({
            "data": { "sections": [
                { "listingTitle": "상세 제목", "roomTypeCategory": "private_room" },
                { "overallRating": 4.7, "overallCount": 33 }
            ] }
        });
        let attrs = extract_detail_attrs(&payload);
        assert_eq!(attrs.name.as_deref(), Some("상세 제목"));
        assert_eq!(attrs.room_type, Some(RoomType::PrivateRoom));
        assert_eq!(attrs.rating, Some(4.7));
        assert_eq!(attrs.review_count, Some(33));
    }

    #[test]
    fn test_payload_hash_stable_and_distinct() {
        let a = search_payload();
        let b = search_payload();
        assert_eq!(payload_hash(&a), payload_hash(&b));
        assert_eq!(payload_hash(&a).len(), 16);
        assert_ne!(payload_hash(&a), payload_hash(&calendar_payload()));
    }
}
