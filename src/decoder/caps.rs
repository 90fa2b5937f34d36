// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stream description negotiated with whoever consumes the decoded surfaces.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::Fraction;

pub const CAPS_WIDTH: &str = "width";
pub const CAPS_HEIGHT: &str = "height";
pub const CAPS_FRAMERATE: &str = "framerate";
pub const CAPS_PIXEL_ASPECT_RATIO: &str = "pixel-aspect-ratio";
pub const CAPS_INTERLACED: &str = "interlaced";
pub const CAPS_CODEC_DATA: &str = "codec-data";

#[derive(Debug, Clone, PartialEq)]
pub enum CapsValue {
    Int(i32),
    Bool(bool),
    Fraction(Fraction),
    String(String),
    Bytes(Bytes),
}

impl From<i32> for CapsValue {
    fn from(value: i32) -> Self {
        CapsValue::Int(value)
    }
}

impl From<bool> for CapsValue {
    fn from(value: bool) -> Self {
        CapsValue::Bool(value)
    }
}

impl From<Fraction> for CapsValue {
    fn from(value: Fraction) -> Self {
        CapsValue::Fraction(value)
    }
}

impl From<&str> for CapsValue {
    fn from(value: &str) -> Self {
        CapsValue::String(value.to_owned())
    }
}

impl From<Bytes> for CapsValue {
    fn from(value: Bytes) -> Self {
        CapsValue::Bytes(value)
    }
}

/// A set of named properties, with a flag raised whenever one of them changes.
#[derive(Debug, Clone, Default)]
pub struct Caps {
    fields: BTreeMap<String, CapsValue>,
    changed: bool,
}

impl Caps {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get(&self, key: &str) -> Option<&CapsValue> {
        self.fields.get(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i32> {
        match self.get(key) {
            Some(CapsValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(CapsValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_fraction(&self, key: &str) -> Option<Fraction> {
        match self.get(key) {
            Some(CapsValue::Fraction(v)) => Some(*v),
            _ => None,
        }
    }

    /// Sets `key` to `value`. Returns whether this changed anything.
    pub fn set<V: Into<CapsValue>>(&mut self, key: &str, value: V) -> bool {
        let value = value.into();
        if self.fields.get(key) == Some(&value) {
            return false;
        }

        log::debug!("caps: {} = {:?}", key, value);
        self.fields.insert(key.to_owned(), value);
        self.changed = true;
        true
    }

    pub fn remove(&mut self, key: &str) -> Option<CapsValue> {
        let value = self.fields.remove(key);
        if value.is_some() {
            self.changed = true;
        }
        value
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CapsValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns whether the caps changed since the last call, and clears the flag.
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_notification() {
        let mut caps = Caps::new();
        assert!(!caps.take_changed());

        assert!(caps.set(CAPS_WIDTH, 320));
        assert!(caps.set(CAPS_FRAMERATE, Fraction::new(30, 1)));
        assert!(caps.take_changed());
        assert!(!caps.take_changed());

        assert!(!caps.set(CAPS_WIDTH, 320));
        assert!(!caps.take_changed());

        assert!(caps.set(CAPS_WIDTH, 640));
        assert!(caps.take_changed());
        assert_eq!(caps.get_int(CAPS_WIDTH), Some(640));
        assert_eq!(caps.get_fraction(CAPS_FRAMERATE), Some(Fraction::new(30, 1)));
        assert_eq!(caps.get_bool(CAPS_WIDTH), None);
    }

    #[test]
    fn remove_flags_change() {
        let mut caps = Caps::new();
        caps.set(CAPS_INTERLACED, true);
        caps.take_changed();

        assert!(caps.remove("unknown").is_none());
        assert!(!caps.take_changed());
        assert_eq!(caps.remove(CAPS_INTERLACED), Some(CapsValue::Bool(true)));
        assert!(caps.take_changed());
        assert!(caps.is_empty());
    }
}
