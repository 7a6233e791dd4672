//! Garden map composition.
//!
//! The vendor SVG is edited textually, one tag per line, the same way the
//! visualisation expects to find it: the mower marker is pulled out, recoloured,
//! tagged, and appended last so it paints above user overlays and the mow track.

use serde_json::{Value, json};

const MOWER_ID: &str = r#"id="mower_pos""#;
const MAP_ID: &str = r#"id="svg_garden_map""#;
const TRACK_PLACEHOLDER: &str = r#"<g id="mower_track_id"></g>"#;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub(crate) enum Error {
    #[error("the map has no mower marker")]
    NoMower,
    #[error("the map has no closing `</svg>` tag")]
    Unterminated,
    #[error("the map is not valid UTF-8")]
    Encoding,
}

/// Split after every `>`, the way the map is laid out line by line.
fn tags(svg: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in svg.chars() {
        if c == '\n' || c == '\r' {
            continue;
        }
        current.push(c);
        if c == '>' {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out
}

/// Hex digits of the configured mower colour.
///
/// Accepts `#00aa00`, `00aa00` and the `mower_colour:"00aa00"` form the admin
/// surface stores.
pub(crate) fn colour_hex(raw: &str) -> String {
    let value = raw.rsplit_once(':').map_or(raw, |(_, v)| v);
    value.trim().trim_matches('"').trim_start_matches('#').to_string()
}

fn recolour(circle: &str, hex: &str) -> String {
    let mut out = circle.to_string();
    if let Some(start) = out.find(r##"fill="#"##).map(|i| i + 7) {
        if let Some(len) = out[start..].find('"') {
            out.replace_range(start..start + len, hex);
        }
    }
    out.replacen("<circle", &format!("<circle {MOWER_ID}"), 1)
}

/// Compose the map shown in the visualisation.
pub(crate) fn compose(svg: &str, colour: &str, overlay: &str) -> Result<String, Error> {
    let mut lines = tags(svg);
    let mower_at = lines
        .iter()
        .rposition(|l| l.contains("<circle") && l.contains(r##"fill="#"##))
        .ok_or(Error::NoMower)?;
    let mut mower = lines.remove(mower_at);
    if !mower.trim_end().ends_with("/>") {
        if lines.get(mower_at).is_some_and(|l| l.trim() == "</circle>") {
            lines.remove(mower_at);
        }
        mower.push_str("</circle>");
    }
    let mower = recolour(&mower, &colour_hex(colour));
    let close = lines
        .iter()
        .rposition(|l| l.trim() == "</svg>")
        .ok_or(Error::Unterminated)?;
    lines.truncate(close);
    if let Some(root) = lines.iter_mut().find(|l| l.contains("<svg")) {
        *root = root.replacen("<svg", &format!("<svg {MAP_ID}"), 1);
    }
    if !overlay.trim().is_empty() {
        lines.extend(tags(overlay));
    }
    lines.push(TRACK_PLACEHOLDER.to_string());
    lines.push(mower);
    lines.push("</svg>".to_string());
    Ok(lines.concat())
}

/// Polyline description of the mow track, styled per model type.
pub(crate) fn mow_track(points: &[String], model_type: i64) -> Value {
    let (stroke, width) = if model_type == 2 {
        ("#C3FECE", 17)
    } else {
        ("#999999", 5)
    };
    json!({
        "Points": points,
        "style": format!(
            "fill:none; stroke:{stroke}; stroke-width: {width}; stroke-linecap:round; stroke-linejoin: round;"
        ),
    })
}
