/// Components of a resource link, e.g.
/// `https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a/instances/x`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SelfLink {
    pub project: Option<String>,
    pub zone: Option<String>,
    pub region: Option<String>,
    pub name: String,
}

/// Returns the last segment of a link.
pub fn trim_self_link(link: &str) -> &str {
    link.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(link)
}

pub fn parse_self_link(link: &str) -> SelfLink {
    let mut result = SelfLink {
        name: trim_self_link(link).to_string(),
        ..Default::default()
    };
    let mut segments = link.trim_end_matches('/').split('/');
    while let Some(segment) = segments.next() {
        let target = match segment {
            "projects" => &mut result.project,
            "zones" => &mut result.zone,
            "regions" => &mut result.region,
            _ => continue,
        };
        if let Some(value) = segments.next() {
            *target = Some(value.to_string());
        }
    }
    if result.region.is_none() {
        result.region = result.zone.as_deref().map(|zone| zone_region(zone).to_string());
    }
    result
}

/// `us-central1-a` -> `us-central1`
pub fn zone_region(zone: &str) -> &str {
    match zone.rfind('-') {
        Some(index) => &zone[..index],
        None => zone,
    }
}
