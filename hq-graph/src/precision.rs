use std::fmt::{Display, Formatter};
use std::str::FromStr;

use itertools::Itertools;
use thiserror::Error;

/// Rounding applied when a value is narrowed into a fixed-point type.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RoundingMode {
    Trn,
    TrnZero,
    Rnd,
    RndZero,
    RndInf,
    RndMinInf,
    RndConv,
}

/// Overflow behaviour when a value does not fit into a fixed-point type.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SaturationMode {
    Wrap,
    Sat,
    SatZero,
    SatSym,
}

/// The optional rounding and saturation semantics attached to a precision.
///
/// `None` means "use the hardware default", which is also how the mode is rendered: not at all.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct QuantModes {
    pub rounding: Option<RoundingMode>,
    pub saturation: Option<SaturationMode>,
    pub saturation_bits: Option<u32>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct IntegerPrecision {
    pub width: u32,
    pub signed: bool,
    pub modes: QuantModes,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct FixedPrecision {
    pub width: u32,
    pub integer: i32,
    pub signed: bool,
    pub modes: QuantModes,
}

/// The numeric type of a tensor in the generated hardware.
///
/// `Text` is the fallback for types that were only ever given as a string, for example straight from a
/// layer configuration. It is edited textually, see [PrecisionType::with_modes].
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum PrecisionType {
    Integer(IntegerPrecision),
    Fixed(FixedPrecision),
    Text(String),
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum PrecisionError {
    #[error("unrecognized precision `{0}`")]
    Unrecognized(String),
    #[error("unknown rounding or saturation mode `{0}`")]
    UnknownMode(String),
}

impl RoundingMode {
    pub const ALL: &'static [Self] = &[
        RoundingMode::Trn,
        RoundingMode::TrnZero,
        RoundingMode::Rnd,
        RoundingMode::RndZero,
        RoundingMode::RndInf,
        RoundingMode::RndMinInf,
        RoundingMode::RndConv,
    ];

    pub fn mnemonic(self) -> &'static str {
        match self {
            RoundingMode::Trn => "TRN",
            RoundingMode::TrnZero => "TRN_ZERO",
            RoundingMode::Rnd => "RND",
            RoundingMode::RndZero => "RND_ZERO",
            RoundingMode::RndInf => "RND_INF",
            RoundingMode::RndMinInf => "RND_MIN_INF",
            RoundingMode::RndConv => "RND_CONV",
        }
    }
}

impl SaturationMode {
    pub const ALL: &'static [Self] = &[
        SaturationMode::Wrap,
        SaturationMode::Sat,
        SaturationMode::SatZero,
        SaturationMode::SatSym,
    ];

    pub fn mnemonic(self) -> &'static str {
        match self {
            SaturationMode::Wrap => "WRAP",
            SaturationMode::Sat => "SAT",
            SaturationMode::SatZero => "SAT_ZERO",
            SaturationMode::SatSym => "SAT_SYM",
        }
    }
}

fn strip_ap(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix("AP_").unwrap_or(s)
}

impl FromStr for RoundingMode {
    type Err = PrecisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = strip_ap(s);
        RoundingMode::ALL
            .iter()
            .copied()
            .find(|m| m.mnemonic() == name)
            .ok_or_else(|| PrecisionError::UnknownMode(s.to_owned()))
    }
}

impl FromStr for SaturationMode {
    type Err = PrecisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = strip_ap(s);
        SaturationMode::ALL
            .iter()
            .copied()
            .find(|m| m.mnemonic() == name)
            .ok_or_else(|| PrecisionError::UnknownMode(s.to_owned()))
    }
}

impl QuantModes {
    pub const NONE: QuantModes = QuantModes {
        rounding: None,
        saturation: None,
        saturation_bits: None,
    };

    pub fn is_empty(&self) -> bool {
        self == &QuantModes::NONE
    }

    /// Overwrite the fields that are set in `update`, keep all others.
    pub fn merged(self, update: &QuantModes) -> QuantModes {
        QuantModes {
            rounding: update.rounding.or(self.rounding),
            saturation: update.saturation.or(self.saturation),
            saturation_bits: update.saturation_bits.or(self.saturation_bits),
        }
    }

    /// Whether every field set in `wanted` is already present with the same value.
    pub fn carries(&self, wanted: &QuantModes) -> bool {
        fn has<T: PartialEq>(actual: Option<T>, wanted: Option<T>) -> bool {
            wanted.map_or(true, |w| actual == Some(w))
        }

        has(self.rounding, wanted.rounding)
            && has(self.saturation, wanted.saturation)
            && has(self.saturation_bits, wanted.saturation_bits)
    }

    fn tokens(&self, ap_style: bool) -> Vec<String> {
        let prefix = if ap_style { "AP_" } else { "" };
        let mut tokens = vec![];
        if let Some(rounding) = self.rounding {
            tokens.push(format!("{}{}", prefix, rounding.mnemonic()));
        }
        if let Some(saturation) = self.saturation {
            tokens.push(format!("{}{}", prefix, saturation.mnemonic()));
        }
        if let Some(bits) = self.saturation_bits {
            tokens.push(bits.to_string());
        }
        tokens
    }
}

impl IntegerPrecision {
    pub fn new(width: u32, signed: bool) -> Self {
        IntegerPrecision {
            width,
            signed,
            modes: QuantModes::NONE,
        }
    }
}

impl FixedPrecision {
    pub fn new(width: u32, integer: i32, signed: bool) -> Self {
        FixedPrecision {
            width,
            integer,
            signed,
            modes: QuantModes::NONE,
        }
    }
}

impl PrecisionType {
    pub fn fixed(width: u32, integer: i32) -> Self {
        PrecisionType::Fixed(FixedPrecision::new(width, integer, true))
    }

    pub fn ufixed(width: u32, integer: i32) -> Self {
        PrecisionType::Fixed(FixedPrecision::new(width, integer, false))
    }

    pub fn int(width: u32) -> Self {
        PrecisionType::Integer(IntegerPrecision::new(width, true))
    }

    pub fn uint(width: u32) -> Self {
        PrecisionType::Integer(IntegerPrecision::new(width, false))
    }

    pub fn text(text: impl Into<String>) -> Self {
        PrecisionType::Text(text.into())
    }

    pub fn is_text(&self) -> bool {
        matches!(self, PrecisionType::Text(_))
    }

    /// The modes of a structured precision, `None` for the text fallback.
    pub fn modes(&self) -> Option<&QuantModes> {
        match self {
            PrecisionType::Integer(p) => Some(&p.modes),
            PrecisionType::Fixed(p) => Some(&p.modes),
            PrecisionType::Text(_) => None,
        }
    }

    /// Whether this precision already encodes every mode set in `wanted`.
    ///
    /// A text precision that cannot be parsed carries nothing.
    pub fn carries(&self, wanted: &QuantModes) -> bool {
        match self {
            PrecisionType::Integer(p) => p.modes.carries(wanted),
            PrecisionType::Fixed(p) => p.modes.carries(wanted),
            PrecisionType::Text(text) => Suffix::split(text).map_or(false, |s| s.modes.carries(wanted)),
        }
    }

    /// Build a new precision with the modes set in `update` applied.
    /// Width, integer bits and signedness are never touched.
    ///
    /// Text precisions get the modes injected into their bracketed suffix.
    pub fn with_modes(&self, update: &QuantModes) -> Result<PrecisionType, PrecisionError> {
        let result = match *self {
            PrecisionType::Integer(p) => PrecisionType::Integer(IntegerPrecision {
                modes: p.modes.merged(update),
                ..p
            }),
            PrecisionType::Fixed(p) => PrecisionType::Fixed(FixedPrecision {
                modes: p.modes.merged(update),
                ..p
            }),
            PrecisionType::Text(ref text) => {
                let suffix = Suffix::split(text)?;
                let modes = suffix.modes.merged(update);
                PrecisionType::Text(suffix.render(&modes))
            }
        };
        Ok(result)
    }

    /// Interpret a text precision as a structured one. Structured precisions are returned as-is.
    pub fn parse_text(&self) -> Result<PrecisionType, PrecisionError> {
        match self {
            PrecisionType::Text(text) => text.parse(),
            other => Ok(other.clone()),
        }
    }
}

/// A text precision split around its bracketed suffix, `head<dims,modes>tail`.
#[derive(Debug)]
struct Suffix<'a> {
    head: &'a str,
    dims: Vec<i32>,
    modes: QuantModes,
    tail: &'a str,
}

impl<'a> Suffix<'a> {
    fn split(text: &'a str) -> Result<Self, PrecisionError> {
        let unrecognized = || PrecisionError::Unrecognized(text.to_owned());

        let open = text.find('<').ok_or_else(unrecognized)?;
        let close = text.rfind('>').ok_or_else(unrecognized)?;
        if close < open || !text[close + 1..].trim().is_empty() {
            return Err(unrecognized());
        }

        let head = &text[..open];
        let max_dims = if head.trim().ends_with("int") { 1 } else { 2 };

        let mut dims = vec![];
        let mut modes = QuantModes::NONE;

        for token in text[open + 1..close].split(',').map(str::trim) {
            // leading integers are the dimensions, later ones can only be the saturation bit count
            if let Ok(dim) = token.parse::<i32>() {
                if dims.len() < max_dims && modes.is_empty() {
                    dims.push(dim);
                    continue;
                }
            }

            if let Ok(rounding) = token.parse::<RoundingMode>() {
                if modes.rounding.replace(rounding).is_some() {
                    return Err(unrecognized());
                }
            } else if let Ok(saturation) = token.parse::<SaturationMode>() {
                if modes.saturation.replace(saturation).is_some() {
                    return Err(unrecognized());
                }
            } else if let Ok(bits) = token.parse::<u32>() {
                if modes.saturation_bits.replace(bits).is_some() {
                    return Err(unrecognized());
                }
            } else {
                return Err(unrecognized());
            }
        }

        if dims.is_empty() {
            return Err(unrecognized());
        }

        Ok(Suffix {
            head,
            dims,
            modes,
            tail: &text[close + 1..],
        })
    }

    fn render(&self, modes: &QuantModes) -> String {
        let ap_style = self.head.trim().starts_with("ap_");
        let tokens = self
            .dims
            .iter()
            .map(|d| d.to_string())
            .chain(modes.tokens(ap_style))
            .join(",");
        format!("{}<{}>{}", self.head, tokens, self.tail)
    }
}

impl FromStr for PrecisionType {
    type Err = PrecisionError;

    /// Parse a structured precision, accepting both the `Display` format and the `ap_` spelling.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unrecognized = || PrecisionError::Unrecognized(s.to_owned());

        let suffix = Suffix::split(s)?;
        let head = suffix.head.trim();
        let kind = head.strip_prefix("ap_").unwrap_or(head);

        let width = |index: usize| -> Result<u32, PrecisionError> {
            let dim = *suffix.dims.get(index).ok_or_else(unrecognized)?;
            u32::try_from(dim).map_err(|_| unrecognized())
        };

        let result = match kind {
            "int" | "uint" => PrecisionType::Integer(IntegerPrecision {
                width: width(0)?,
                signed: kind == "int",
                modes: suffix.modes,
            }),
            "fixed" | "ufixed" => PrecisionType::Fixed(FixedPrecision {
                width: width(0)?,
                integer: *suffix.dims.get(1).ok_or_else(unrecognized)?,
                signed: kind == "fixed",
                modes: suffix.modes,
            }),
            _ => return Err(unrecognized()),
        };

        Ok(result)
    }
}

impl Display for RoundingMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

impl Display for SaturationMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

impl Display for QuantModes {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for token in self.tokens(false) {
            write!(f, ",{}", token)?;
        }
        Ok(())
    }
}

impl Display for PrecisionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PrecisionType::Integer(p) => {
                let sign = if p.signed { "" } else { "u" };
                write!(f, "{}int<{}{}>", sign, p.width, p.modes)
            }
            PrecisionType::Fixed(p) => {
                let sign = if p.signed { "" } else { "u" };
                write!(f, "{}fixed<{},{}{}>", sign, p.width, p.integer, p.modes)
            }
            PrecisionType::Text(text) => write!(f, "{}", text),
        }
    }
}
