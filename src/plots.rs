use crate::domain::Season;
use crate::error::CatalogError;

/// Id of the first site of the season whose name is one of the path's segments.
pub fn match_plot(file_path: &str, season_id: i64, seasons: &[Season]) -> Result<i64, CatalogError> {
    let segments = file_path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();

    seasons
        .iter()
        .find(|season| season.id == season_id)
        .and_then(|season| {
            season.sites.iter().find(|site| {
                site.sitename
                    .as_deref()
                    .is_some_and(|name| segments.contains(&name))
            })
        })
        .map(|site| site.id)
        .ok_or_else(|| CatalogError::PlotNotMatched(file_path.to_string()))
}
