//! Persisted session state.
//!
//! Flat text, pipe-delimited sections:
//! `[CONTROLS] <gain> <wetDry> <bypass> <normalise> |[IrFile] <path>|`
//! Parsing is best-effort per field: a malformed token loses that one field,
//! never the line. Hosts in some locales hand back `,` decimals, so numeric
//! tokens are normalized before parsing.

pub const IR_FILE_NONE: &str = "None";

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedState {
    pub gain: Option<f32>,
    pub wet_dry: Option<f32>,
    pub bypass: Option<bool>,
    pub normalise: Option<bool>,
    pub ir_file: Option<String>,
}

pub fn format_state(
    gain: f32,
    wet_dry: f32,
    bypass: bool,
    normalise: bool,
    ir_file: &str,
) -> String {
    format!(
        "[CONTROLS] {} {} {} {} |[IrFile] {}|",
        gain,
        wet_dry,
        bypass as u32,
        normalise as u32,
        ir_file
    )
}

fn parse_float(token: &str) -> Option<f32> {
    token.replace(',', ".").parse::<f32>().ok()
}

pub fn parse_state(stream: &str) -> ParsedState {
    let mut state = ParsedState::default();
    for segment in stream.split('|') {
        let segment = segment.trim_start();
        if let Some(rest) = segment.strip_prefix("[CONTROLS]") {
            let tokens: Vec<&str> = rest.split_whitespace().collect();
            state.gain = tokens.first().and_then(|t| parse_float(t));
            state.wet_dry = tokens.get(1).and_then(|t| parse_float(t));
            state.bypass = tokens.get(2).and_then(|t| parse_float(t)).map(|v| v != 0.0);
            state.normalise = tokens.get(3).and_then(|t| parse_float(t)).map(|v| v != 0.0);
        } else if let Some(rest) = segment.strip_prefix("[IrFile]") {
            let path = rest.trim();
            if !path.is_empty() {
                state.ir_file = Some(path.to_string());
            }
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_documented_example() {
        let state = parse_state("[CONTROLS] 3.0 50 1 0 |[IrFile] /tmp/x.wav|");
        assert_eq!(state.gain, Some(3.0));
        assert_eq!(state.wet_dry, Some(50.0));
        assert_eq!(state.bypass, Some(true));
        assert_eq!(state.normalise, Some(false));
        assert_eq!(state.ir_file.as_deref(), Some("/tmp/x.wav"));
    }

    #[test]
    fn round_trip_preserves_fields() {
        let text = format_state(-6.5, 42.0, false, true, "/ir/room one.wav");
        let state = parse_state(&text);
        assert_eq!(state.gain, Some(-6.5));
        assert_eq!(state.wet_dry, Some(42.0));
        assert_eq!(state.bypass, Some(false));
        assert_eq!(state.normalise, Some(true));
        assert_eq!(state.ir_file.as_deref(), Some("/ir/room one.wav"));
    }

    #[test]
    fn comma_decimal_is_normalized() {
        let state = parse_state("[CONTROLS] 3,5 12,5 0 1 |[IrFile] None|");
        assert_eq!(state.gain, Some(3.5));
        assert_eq!(state.wet_dry, Some(12.5));
        assert_eq!(state.ir_file.as_deref(), Some("None"));
    }

    #[test]
    fn malformed_token_loses_only_that_field() {
        let state = parse_state("[CONTROLS] x2 50 1 0 |[IrFile] /a.wav|");
        assert_eq!(state.gain, None);
        assert_eq!(state.wet_dry, Some(50.0));
        assert_eq!(state.bypass, Some(true));
        assert_eq!(state.ir_file.as_deref(), Some("/a.wav"));
    }

    #[test]
    fn unknown_sections_are_ignored() {
        let state = parse_state("[FUTURE] 1 2 3 |[CONTROLS] 0 100 0 1 |[IrFile] None|");
        assert_eq!(state.wet_dry, Some(100.0));
    }

    #[test]
    fn empty_stream_parses_to_nothing() {
        assert_eq!(parse_state(""), ParsedState::default());
    }
}
