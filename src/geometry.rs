use regex::Regex;

use crate::domain::BoundingBox;
use crate::error::CatalogError;

/// Bounding box of a WKT geometry; X is longitude and Y latitude.
pub fn wkt_bounds(wkt: &str) -> Result<BoundingBox, CatalogError> {
    let invalid = || CatalogError::InvalidGeometry(wkt.to_string());

    let header = Regex::new(r"^\s*(?i:(MULTI)?(POINT|LINESTRING|POLYGON))\s*(?i:Z|M|ZM)?\s*\(")
        .map_err(|err| CatalogError::InvalidGeometry(err.to_string()))?;
    let Some(found) = header.find(wkt) else {
        return Err(invalid());
    };
    let body = &wkt[found.end() - 1..];
    if body.matches('(').count() != body.matches(')').count() || !body.trim_end().ends_with(')')
    {
        return Err(invalid());
    }

    let mut bounds: Option<BoundingBox> = None;
    for tuple in body.split(['(', ')', ',']) {
        let tuple = tuple.trim();
        if tuple.is_empty() {
            continue;
        }
        let mut values = tuple.split_whitespace().map(str::parse::<f64>);
        let (Some(Ok(x)), Some(Ok(y))) = (values.next(), values.next()) else {
            return Err(invalid());
        };
        if values.any(|value| value.is_err()) {
            return Err(invalid());
        }

        bounds = Some(match bounds {
            None => BoundingBox {
                min_lat: y,
                min_lon: x,
                max_lat: y,
                max_lon: x,
            },
            Some(current) => BoundingBox {
                min_lat: current.min_lat.min(y),
                min_lon: current.min_lon.min(x),
                max_lat: current.max_lat.max(y),
                max_lon: current.max_lon.max(x),
            },
        });
    }

    bounds.ok_or_else(invalid)
}
