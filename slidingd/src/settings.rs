//! Line-oriented configuration deserializer.
//!
//! The format is `key value` per line, `#` comments, blank lines ignored.
//! Later occurrences of a key win, so command-line overrides can simply be
//! appended to the file contents.

use bstr::ByteSlice;
use serde::de::{self, DeserializeSeed, IntoDeserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::collections::{BTreeSet, VecDeque};
use std::fmt::Display;
use std::iter::Rev;
use std::str::FromStr;

pub fn from_bytes<'a, T>(input: &'a [u8]) -> Result<T>
where
    T: Deserialize<'a>,
{
    T::deserialize(&mut Deserializer::from_bytes(input))
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("{0}")]
    ParseValue(String),

    #[error("argument must be 'yes', 'no', '1' or '0'")]
    InvalidBool,

    #[error("wrong number of arguments")]
    WrongArity,

    #[error("{0}")]
    Custom(String),
}

impl de::Error for SettingsError {
    fn custom<T: Display>(msg: T) -> Self {
        Self::Custom(msg.to_string())
    }
}

type Result<T> = std::result::Result<T, SettingsError>;

struct Deserializer<'de> {
    // lines are processed in reverse order so the last occurrence of a
    // duplicated key wins
    lines: Rev<bstr::Lines<'de>>,
    seen_keys: BTreeSet<Vec<u8>>,
    // tokens of the line currently being consumed: key first, then values
    tokens: VecDeque<Vec<u8>>,
}

impl<'de> Deserializer<'de> {
    fn from_bytes(input: &'de [u8]) -> Self {
        Self {
            lines: input.lines().rev(),
            seen_keys: BTreeSet::new(),
            tokens: VecDeque::new(),
        }
    }

    fn next_key(&mut self) -> Result<Option<String>> {
        if self.tokens.is_empty() {
            self.read_next_line();
        }
        match self.tokens.pop_front() {
            Some(key) => String::from_utf8(key)
                .map(Some)
                .map_err(|err| SettingsError::ParseValue(err.to_string())),
            None => Ok(None),
        }
    }

    fn read_next_line(&mut self) {
        for line in self.lines.by_ref() {
            let line = line.trim_with(|c| matches!(c, ' ' | '\t' | '\r' | '\n'));
            if let Some(b'#') | None = line.first() {
                continue;
            }
            let mut tokens: VecDeque<Vec<u8>> =
                line.fields().map(|field| field.to_vec()).collect();
            let Some(key) = tokens.front_mut() else {
                continue;
            };
            key.make_ascii_lowercase();
            if self.seen_keys.insert(key.clone()) {
                self.tokens = tokens;
                return;
            }
        }
    }

    fn next_value(&mut self) -> Result<Vec<u8>> {
        self.tokens.pop_front().ok_or(SettingsError::WrongArity)
    }

    fn parse_next<T>(&mut self) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.next_string()?
            .parse()
            .map_err(|err: T::Err| SettingsError::ParseValue(err.to_string()))
    }

    fn next_string(&mut self) -> Result<String> {
        String::from_utf8(self.next_value()?)
            .map_err(|err| SettingsError::ParseValue(err.to_string()))
    }
}

macro_rules! parsed_scalars {
    ($($method:ident => $visit:ident,)*) => {
        $(fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
            visitor.$visit(self.parse_next()?)
        })*
    }
}

impl<'de> de::Deserializer<'de> for &mut Deserializer<'de> {
    type Error = SettingsError;

    parsed_scalars! {
        deserialize_i8 => visit_i8,
        deserialize_i16 => visit_i16,
        deserialize_i32 => visit_i32,
        deserialize_i64 => visit_i64,
        deserialize_u8 => visit_u8,
        deserialize_u16 => visit_u16,
        deserialize_u32 => visit_u32,
        deserialize_u64 => visit_u64,
        deserialize_f32 => visit_f32,
        deserialize_f64 => visit_f64,
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        let value = self.next_value()?;
        if value.eq_ignore_ascii_case(b"yes") || value == b"1" {
            return visitor.visit_bool(true);
        }
        if value.eq_ignore_ascii_case(b"no") || value == b"0" {
            return visitor.visit_bool(false);
        }
        Err(SettingsError::InvalidBool)
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_string(self.next_string()?)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_string(self.next_string()?)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        // a present key always carries a value
        visitor.visit_some(self)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_map(Fields { de: self })
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value> {
        self.deserialize_map(visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.next_value()?;
        visitor.visit_unit()
    }

    fn deserialize_any<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value> {
        Err(SettingsError::Custom("unsupported value shape".to_owned()))
    }

    serde::forward_to_deserialize_any! {
        i128 u128 char bytes byte_buf unit unit_struct newtype_struct seq
        tuple tuple_struct enum identifier
    }
}

struct Fields<'a, 'de> {
    de: &'a mut Deserializer<'de>,
}

impl<'de> MapAccess<'de> for Fields<'_, 'de> {
    type Error = SettingsError;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>>
    where
        K: DeserializeSeed<'de>,
    {
        match self.de.next_key()? {
            Some(key) => seed.deserialize(key.into_deserializer()).map(Some),
            None => Ok(None),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value>
    where
        V: DeserializeSeed<'de>,
    {
        seed.deserialize(&mut *self.de)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Deserialize)]
    #[serde(deny_unknown_fields, rename_all = "kebab-case")]
    struct Sample {
        #[serde(default)]
        port: u16,
        #[serde(default)]
        in_memory: bool,
        #[serde(default)]
        eps: Option<f64>,
        #[serde(default)]
        name: Option<String>,
    }

    #[test]
    fn empty_input_uses_defaults() {
        let sample: Sample = from_bytes(b"").unwrap();
        assert_eq!(sample, Sample { port: 0, in_memory: false, eps: None, name: None });
    }

    #[test]
    fn parses_values_and_comments() {
        let sample: Sample = from_bytes(
            b"# a comment\nport 4553\n\nin-memory yes\neps 0.05\nname counts\n",
        )
        .unwrap();
        assert_eq!(sample.port, 4553);
        assert!(sample.in_memory);
        assert_eq!(sample.eps, Some(0.05));
        assert_eq!(sample.name.as_deref(), Some("counts"));
    }

    #[test]
    fn last_occurrence_wins() {
        let sample: Sample = from_bytes(b"port 1\nport 2\nPORT 3\n").unwrap();
        assert_eq!(sample.port, 3);
    }

    #[test]
    fn bool_accepts_yes_no_and_digits() {
        for (input, expected) in
            [("yes", true), ("No", false), ("1", true), ("0", false)]
        {
            let sample: Sample =
                from_bytes(format!("in-memory {input}\n").as_bytes()).unwrap();
            assert_eq!(sample.in_memory, expected);
        }
        assert!(from_bytes::<Sample>(b"in-memory maybe\n").is_err());
    }

    #[test]
    fn unknown_keys_and_missing_values_fail() {
        assert!(from_bytes::<Sample>(b"bogus 1\n").is_err());
        assert!(from_bytes::<Sample>(b"port\n").is_err());
        assert!(from_bytes::<Sample>(b"port many\n").is_err());
    }
}
