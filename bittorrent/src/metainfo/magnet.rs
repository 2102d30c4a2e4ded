// Magnet URI parsing (BEP 9 bootstrap descriptor). Delivers a structured
// descriptor to the engine; no opinion on how the caller obtained the string.

use url::Url;

use super::MetaInfoError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoHash {
    V1([u8; 20]),
    V2([u8; 32]),
}

impl InfoHash {
    pub fn truncated(&self) -> [u8; 20] {
        match self {
            InfoHash::V1(h) => *h,
            InfoHash::V2(h) => {
                let mut out = [0u8; 20];
                out.copy_from_slice(&h[..20]);
                out
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MagnetLink {
    pub info_hash: Option<InfoHash>,
    pub display_name: Option<String>,
    // Tracker tiers; magnet URIs carry a flat list, `tr.N` groups them into
    // tiers per BEP 12.
    pub trackers: Vec<Vec<Url>>,
    pub webseeds: Vec<Url>,
    pub acceptable_sources: Vec<Url>,
    // Selected file indices (BEP 53), `so=1,3,4-8`.
    pub selected_files: Vec<usize>,
}

pub fn parse(uri: &str) -> Result<MagnetLink, MetaInfoError> {
    let stripped = uri
        .strip_prefix("magnet:?")
        .ok_or_else(|| MetaInfoError::InvalidMagnet("missing magnet:? prefix".into()))?;

    let mut link = MagnetLink::default();
    let mut tier_trackers: Vec<(u32, Url)> = Vec::new();

    for pair in stripped.split('&') {
        let Some((key, value)) = pair.split_once('=') else { continue };
        let value = urlencoding::decode(value)
            .map_err(|e| MetaInfoError::InvalidMagnet(e.to_string()))?
            .into_owned();

        if key == "xt" {
            link.info_hash = Some(parse_xt(&value)?);
        } else if key == "dn" {
            link.display_name = Some(value);
        } else if key == "tr" {
            let url = Url::parse(&value).map_err(|e| MetaInfoError::InvalidMagnet(e.to_string()))?;
            tier_trackers.push((0, url));
        } else if let Some(tier) = key.strip_prefix("tr.") {
            let tier: u32 = tier.parse().unwrap_or(0);
            let url = Url::parse(&value).map_err(|e| MetaInfoError::InvalidMagnet(e.to_string()))?;
            tier_trackers.push((tier, url));
        } else if key == "ws" {
            link.webseeds.push(Url::parse(&value).map_err(|e| MetaInfoError::InvalidMagnet(e.to_string()))?);
        } else if key == "as" {
            link.acceptable_sources.push(Url::parse(&value).map_err(|e| MetaInfoError::InvalidMagnet(e.to_string()))?);
        } else if key == "so" {
            link.selected_files = parse_selected(&value)?;
        }
    }

    if link.info_hash.is_none() {
        return Err(MetaInfoError::InvalidMagnet("missing xt".into()));
    }

    link.trackers = group_into_tiers(tier_trackers);
    Ok(link)
}

fn parse_xt(value: &str) -> Result<InfoHash, MetaInfoError> {
    let hex_or_b32 = value
        .strip_prefix("urn:btih:")
        .ok_or_else(|| MetaInfoError::InvalidMagnet("unsupported xt urn".into()))?;

    let bytes = if hex_or_b32.len() == 40 {
        hex::decode(hex_or_b32).map_err(|e| MetaInfoError::InvalidMagnet(e.to_string()))?
    } else {
        base32::decode(base32::Alphabet::RFC4648 { padding: false }, hex_or_b32)
            .ok_or_else(|| MetaInfoError::InvalidMagnet("invalid base32 info-hash".into()))?
    };

    match bytes.len() {
        20 => {
            let mut h = [0u8; 20];
            h.copy_from_slice(&bytes);
            Ok(InfoHash::V1(h))
        }
        32 => {
            let mut h = [0u8; 32];
            h.copy_from_slice(&bytes);
            Ok(InfoHash::V2(h))
        }
        n => Err(MetaInfoError::InvalidMagnet(format!("info-hash has unexpected length {n}"))),
    }
}

fn parse_selected(value: &str) -> Result<Vec<usize>, MetaInfoError> {
    let mut out = Vec::new();
    for part in value.split(',') {
        if let Some((start, end)) = part.split_once('-') {
            let start: usize = start.parse().map_err(|_| MetaInfoError::InvalidMagnet("bad so range".into()))?;
            let end: usize = end.parse().map_err(|_| MetaInfoError::InvalidMagnet("bad so range".into()))?;
            out.extend(start..=end);
        } else if !part.is_empty() {
            out.push(part.parse().map_err(|_| MetaInfoError::InvalidMagnet("bad so index".into()))?);
        }
    }
    Ok(out)
}

fn group_into_tiers(mut tier_trackers: Vec<(u32, Url)>) -> Vec<Vec<Url>> {
    tier_trackers.sort_by_key(|(tier, _)| *tier);
    let mut tiers: Vec<Vec<Url>> = Vec::new();
    let mut last_tier = None;
    for (tier, url) in tier_trackers {
        if last_tier != Some(tier) {
            tiers.push(Vec::new());
            last_tier = Some(tier);
        }
        tiers.last_mut().unwrap().push(url);
    }
    tiers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_xt_and_trackers() {
        let uri = "magnet:?xt=urn:btih:f1a8db22ffe20c7014c6267b5f68b97fdc438b1&dn=hello&tr=http%3A%2F%2Ftracker.example%2Fannounce";
        let link = parse(uri).unwrap();
        assert_eq!(link.display_name.as_deref(), Some("hello"));
        assert_eq!(link.trackers.len(), 1);
        match link.info_hash.unwrap() {
            InfoHash::V1(h) => assert_eq!(hex::encode(h), "f1a8db22ffe20c7014c6267b5f68b97fdc438b1"),
            InfoHash::V2(_) => panic!("expected v1"),
        }
    }

    #[test]
    fn parses_selected_file_ranges() {
        let uri = "magnet:?xt=urn:btih:f1a8db22ffe20c7014c6267b5f68b97fdc438b1&so=1,3,4-6";
        let link = parse(uri).unwrap();
        assert_eq!(link.selected_files, vec![1, 3, 4, 5, 6]);
    }

    #[test]
    fn missing_xt_is_rejected() {
        assert!(parse("magnet:?dn=hello").is_err());
    }
}
