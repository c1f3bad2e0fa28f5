// This file is part of a container-format media engine.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `Media<K, V>`: a lazily evaluated, bounded sequence of track samples.
//!
//! A `Media` is a `[a, b)` index range plus a function from index to `V`. Building one
//! never materializes its elements; `filter`/`transform`/`transform_with` compose new
//! index-to-value functions without touching the elements underneath. Elements are only
//! produced on demand, by `get`/`iter`/`to_vec`.

use crate::settings::Kind;
use base::{bail, Error};
use std::sync::Arc;

type Producer<V> = Arc<dyn Fn(u32) -> V + Send + Sync>;

pub struct Media<K: Kind, V: Clone> {
    f: Producer<V>,
    a: u32,
    b: u32,
    settings: K::Settings,
}

impl<K: Kind, V: Clone> Clone for Media<K, V> {
    fn clone(&self) -> Self {
        Media {
            f: self.f.clone(),
            a: self.a,
            b: self.b,
            settings: self.settings.clone(),
        }
    }
}

impl<K: Kind, V: Clone + Send + Sync + 'static> Media<K, V> {
    /// Wraps an in-memory vector as a `Media` over its full range.
    pub fn from_vec(settings: K::Settings, v: Vec<V>) -> Media<K, V> {
        let len = v.len() as u32;
        let v = Arc::new(v);
        Media {
            f: Arc::new(move |i| v[i as usize].clone()),
            a: 0,
            b: len,
            settings,
        }
    }

    /// Wraps an arbitrary index-to-value function over `[a, b)`.
    pub fn from_fn(
        settings: K::Settings,
        a: u32,
        b: u32,
        f: impl Fn(u32) -> V + Send + Sync + 'static,
    ) -> Media<K, V> {
        Media { f: Arc::new(f), a, b, settings }
    }

    pub fn settings(&self) -> &K::Settings {
        &self.settings
    }

    pub fn a(&self) -> u32 {
        self.a
    }

    pub fn b(&self) -> u32 {
        self.b
    }

    pub fn count(&self) -> u32 {
        self.b - self.a
    }

    pub fn len(&self) -> u32 {
        self.count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn bounds(&self) -> (u32, u32) {
        (self.a, self.b)
    }

    pub fn set_bounds(&mut self, a: u32, b: u32) {
        self.a = a.min(b);
        self.b = b;
    }

    /// The element at absolute index `x`. Fails `OutOfRange` outside `[a, b)`.
    pub fn get(&self, x: u32) -> Result<V, Error> {
        if x < self.a || x >= self.b {
            bail!(OutOfRange, msg("index {} out of range [{}, {})", x, self.a, self.b));
        }
        Ok((self.f)(x))
    }

    pub fn iter(&self) -> MediaIter<'_, K, V> {
        MediaIter { media: self, next: self.a }
    }

    pub fn to_vec(&self) -> Vec<V> {
        (self.a..self.b).map(|i| (self.f)(i)).collect()
    }

    /// Keeps only the indices whose element satisfies `pred`, materializing the dense
    /// `0..m -> original_index` mapping eagerly (this does force the predicate over every
    /// element, but not the downstream transform chain).
    pub fn filter(&self, pred: impl Fn(&V) -> bool + Send + Sync + 'static) -> Media<K, V> {
        self.filter_index(|i| pred(&(self.f)(i)))
    }

    /// Keeps only the indices for which `pred` holds, renumbering the surviving elements
    /// to a contiguous `[0, m)` range.
    pub fn filter_index(&self, pred: impl Fn(u32) -> bool) -> Media<K, V> {
        let kept: Vec<u32> = (self.a..self.b).filter(|&i| pred(i)).collect();
        let f = self.f.clone();
        let n = kept.len() as u32;
        let kept = Arc::new(kept);
        Media {
            f: Arc::new(move |i| f(kept[i as usize])),
            a: 0,
            b: n,
            settings: self.settings.clone(),
        }
    }

    /// Maps every element through `f`, preserving bounds and settings.
    pub fn transform<W: Clone + Send + Sync + 'static>(
        &self,
        f: impl Fn(V) -> W + Send + Sync + 'static,
    ) -> Media<K, W> {
        let src = self.f.clone();
        Media {
            f: Arc::new(move |i| f(src(i))),
            a: self.a,
            b: self.b,
            settings: self.settings.clone(),
        }
    }

    /// Maps every element through `f`, additionally rewriting the settings through `g`.
    pub fn transform_settings<W: Clone + Send + Sync + 'static>(
        &self,
        f: impl Fn(V) -> W + Send + Sync + 'static,
        g: impl Fn(&K::Settings) -> K::Settings,
    ) -> Media<K, W> {
        let src = self.f.clone();
        Media {
            f: Arc::new(move |i| f(src(i))),
            a: self.a,
            b: self.b,
            settings: g(&self.settings),
        }
    }

    /// Combines two aligned `Media`s elementwise, bounded by the tighter of the two ranges
    /// (`a = min(a1, a2)`, `b = min(b1, b2)`).
    pub fn transform_with<W: Clone + Send + Sync + 'static, U: Clone + Send + Sync + 'static>(
        &self,
        other: &Media<K, U>,
        combine: impl Fn(V, U) -> W + Send + Sync + 'static,
    ) -> Media<K, W> {
        let f1 = self.f.clone();
        let f2 = other.f.clone();
        Media {
            f: Arc::new(move |i| combine(f1(i), f2(i))),
            a: self.a.min(other.a),
            b: self.b.min(other.b),
            settings: self.settings.clone(),
        }
    }
}

pub struct MediaIter<'a, K: Kind, V: Clone> {
    media: &'a Media<K, V>,
    next: u32,
}

impl<'a, K: Kind, V: Clone + Send + Sync + 'static> Iterator for MediaIter<'a, K, V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        if self.next >= self.media.b {
            return None;
        }
        let v = (self.media.f)(self.next);
        self.next += 1;
        Some(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{AudioCodec, AudioKind, AudioSettings};

    fn settings() -> AudioSettings {
        AudioSettings {
            codec: AudioCodec::AacLc,
            timescale: 44100,
            sample_rate: 44100,
            channels: 2,
            bitrate: 128_000,
        }
    }

    #[test]
    fn to_vec_materializes_in_order() {
        let m: Media<AudioKind, u32> = Media::from_vec(settings(), vec![10, 20, 30]);
        assert_eq!(m.to_vec(), vec![10, 20, 30]);
    }

    #[test]
    fn filter_renumbers_surviving_indices() {
        let m: Media<AudioKind, u32> = Media::from_vec(settings(), vec![1, 2, 3, 4, 5]);
        let evens = m.filter(|v| v % 2 == 0);
        assert_eq!(evens.count(), 2);
        assert_eq!(evens.to_vec(), vec![2, 4]);
    }

    #[test]
    fn transform_with_bounds_to_shorter_input() {
        let a: Media<AudioKind, u32> = Media::from_vec(settings(), vec![1, 2, 3]);
        let mut b: Media<AudioKind, u32> = Media::from_vec(settings(), vec![10, 20]);
        b.set_bounds(0, 2);
        let combined = a.transform_with(&b, |x, y| x + y);
        assert_eq!(combined.count(), 2);
        assert_eq!(combined.to_vec(), vec![11, 22]);
    }

    #[test]
    fn get_out_of_bounds_fails() {
        let m: Media<AudioKind, u32> = Media::from_vec(settings(), vec![1, 2]);
        assert!(m.get(5).is_err());
    }
}
