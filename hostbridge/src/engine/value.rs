use std::{fmt, rc::Rc};

/// Engine strings are stored as UTF-16 code units, like the script values
/// they model. Lone surrogates are preserved until a UTF-8 conversion.
pub type JsStr = Rc<[u16]>;

/// A stable identifier for a heap allocation.
///
/// Packs a slot `index` with the slot `generation` at allocation time, so a
/// stale id is detected once the slot is reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    index: u32,
    generation: u32,
}

impl ObjectId {
    pub(crate) fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({}@{})", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub(crate) u64);

/// Symbols the engine pre-registers at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownSymbol {
    Iterator,
    ToStringTag,
}

impl WellKnownSymbol {
    pub(crate) const ALL: [WellKnownSymbol; 2] =
        [WellKnownSymbol::Iterator, WellKnownSymbol::ToStringTag];

    pub(crate) fn description(self) -> &'static str {
        match self {
            WellKnownSymbol::Iterator => "Symbol.iterator",
            WellKnownSymbol::ToStringTag => "Symbol.toStringTag",
        }
    }

    pub(crate) fn property_name(self) -> &'static str {
        match self {
            WellKnownSymbol::Iterator => "iterator",
            WellKnownSymbol::ToStringTag => "toStringTag",
        }
    }
}

/// The result of `typeof_value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Symbol,
    Object,
    Function,
    External,
}

/// A script value as the engine stores it.
#[derive(Debug, Clone)]
pub enum Val {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(JsStr),
    Symbol(SymbolId),
    Object(ObjectId),
}

impl Val {
    pub(crate) fn from_str(s: &str) -> Self {
        Val::String(js_str(s))
    }

    pub(crate) fn as_object(&self) -> Option<ObjectId> {
        match self {
            Val::Object(id) => Some(*id),
            _ => None,
        }
    }

    pub(crate) fn truthy(&self) -> bool {
        match self {
            Val::Undefined | Val::Null => false,
            Val::Bool(b) => *b,
            Val::Number(n) => !(n.is_nan() || *n == 0.0),
            Val::String(s) => !s.is_empty(),
            Val::Symbol(_) | Val::Object(_) => true,
        }
    }

    pub(crate) fn strict_equals(&self, other: &Val) -> bool {
        match (self, other) {
            (Val::Undefined, Val::Undefined) | (Val::Null, Val::Null) => true,
            (Val::Bool(a), Val::Bool(b)) => a == b,
            (Val::Number(a), Val::Number(b)) => a == b,
            (Val::String(a), Val::String(b)) => a == b,
            (Val::Symbol(a), Val::Symbol(b)) => a == b,
            (Val::Object(a), Val::Object(b)) => a == b,
            _ => false,
        }
    }
}

/// A property key: either a string or a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    String(JsStr),
    Symbol(SymbolId),
}

impl PropertyKey {
    pub(crate) fn from_str(s: &str) -> Self {
        PropertyKey::String(js_str(s))
    }

    pub(crate) fn from_index(index: u32) -> Self {
        PropertyKey::from_str(&index.to_string())
    }

    /// The canonical array index this key names, if any.
    pub(crate) fn array_index(&self) -> Option<u32> {
        let PropertyKey::String(units) = self else {
            return None;
        };
        if units.is_empty() || units.len() > 10 {
            return None;
        }
        if units.len() > 1 && units[0] == b'0' as u16 {
            return None;
        }
        let mut value: u64 = 0;
        for &unit in units.iter() {
            if !(b'0' as u16..=b'9' as u16).contains(&unit) {
                return None;
            }
            value = value * 10 + u64::from(unit - b'0' as u16);
        }
        // 2^32 - 1 is not a valid array index
        (value < u64::from(u32::MAX)).then_some(value as u32)
    }

    pub(crate) fn is_named(&self, name: &str) -> bool {
        match self {
            PropertyKey::String(units) => {
                units.iter().copied().eq(name.encode_utf16())
            }
            PropertyKey::Symbol(_) => false,
        }
    }

    pub(crate) fn to_val(&self) -> Val {
        match self {
            PropertyKey::String(s) => Val::String(s.clone()),
            PropertyKey::Symbol(sym) => Val::Symbol(*sym),
        }
    }
}

pub(crate) fn js_str(s: &str) -> JsStr {
    s.encode_utf16().collect::<Vec<_>>().into()
}

pub(crate) fn utf16_to_string(units: &[u16]) -> String {
    char::decode_utf16(units.iter().copied())
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Formats a number the way scripts print integral and special values.
pub(crate) fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e21 {
        return format!("{}", n as i128);
    }
    format!("{n}")
}

pub(crate) fn string_to_number(units: &[u16]) -> f64 {
    let s = utf16_to_string(units);
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ => trimmed.parse::<f64>().unwrap_or(f64::NAN),
    }
}

/// Truncates towards zero and wraps modulo 2^32, like a script `ToInt32`.
pub(crate) fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let wrapped = n.trunc().rem_euclid(4294967296.0);
    wrapped as u32 as i32
}

pub(crate) fn to_int64(n: f64) -> i64 {
    if !n.is_finite() {
        return 0;
    }
    // saturating cast
    n.trunc() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_array_indices() {
        assert_eq!(PropertyKey::from_str("0").array_index(), Some(0));
        assert_eq!(PropertyKey::from_str("42").array_index(), Some(42));
        assert_eq!(PropertyKey::from_str("042").array_index(), None);
        assert_eq!(PropertyKey::from_str("-1").array_index(), None);
        assert_eq!(PropertyKey::from_str("length").array_index(), None);
        assert_eq!(PropertyKey::from_str("4294967295").array_index(), None);
        assert_eq!(
            PropertyKey::from_str("4294967294").array_index(),
            Some(4294967294)
        );
    }

    #[test]
    fn numbers_print_like_scripts() {
        assert_eq!(number_to_string(7.0), "7");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(0.5), "0.5");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn int32_conversion_wraps() {
        assert_eq!(to_int32(4294967296.0 + 5.0), 5);
        assert_eq!(to_int32(-1.5), -1);
        assert_eq!(to_int32(2147483648.0), i32::MIN);
        assert_eq!(to_int32(f64::NAN), 0);
    }

    #[test]
    fn strict_equality_follows_number_rules() {
        assert!(!Val::Number(f64::NAN).strict_equals(&Val::Number(f64::NAN)));
        assert!(Val::Number(0.0).strict_equals(&Val::Number(-0.0)));
        assert!(Val::from_str("a").strict_equals(&Val::from_str("a")));
        assert!(!Val::Null.strict_equals(&Val::Undefined));
    }
}
