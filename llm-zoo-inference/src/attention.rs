#[cfg(test)]
#[path = "../tests/unit/attention_test.rs"]
mod attention_test;

use rayon::prelude::*;

use crate::tensor::{self, dot};

/// Number of positions reserved at once when an unbounded cache grows.
const CACHE_CHUNK: usize = 64;

/// Key/value cache of one decoder: one entry per processed position, partitioned by
/// key/value group.
///
/// Slots are reserved in chunks up to `capacity` and the cache never grows past it.
/// Keys and values of a position are stored group-major: `[group][head_size]`.
pub struct KvCache {
    group_count: usize,
    head_size: usize,
    capacity: Option<usize>,
    len: usize,
    keys: Vec<f32>,
    values: Vec<f32>,
}

impl KvCache {
    pub fn new(group_count: usize, head_size: usize, capacity: Option<usize>) -> Self {
        Self { group_count, head_size, capacity, len: 0, keys: Vec::new(), values: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn entry_size(&self) -> usize {
        self.group_count * self.head_size
    }

    /// Appends the key and value of the next position.
    pub fn push(&mut self, key: &[f32], value: &[f32]) {
        let entry_size = self.entry_size();
        assert_eq!(key.len(), entry_size, "Key must hold {} values", entry_size);
        assert_eq!(value.len(), entry_size, "Value must hold {} values", entry_size);
        if let Some(capacity) = self.capacity {
            assert!(self.len < capacity, "Key/value cache is full: the context holds {capacity} positions");
        }

        if self.keys.len() == self.keys.capacity() {
            let remaining = self.capacity.map_or(CACHE_CHUNK, |capacity| capacity - self.len);
            let positions = remaining.min(CACHE_CHUNK);
            self.keys.reserve_exact(positions * entry_size);
            self.values.reserve_exact(positions * entry_size);
        }

        self.keys.extend_from_slice(key);
        self.values.extend_from_slice(value);
        self.len += 1;
    }

    pub fn key(&self, position: usize, group: usize) -> &[f32] {
        self.slot(&self.keys, position, group)
    }

    pub fn value(&self, position: usize, group: usize) -> &[f32] {
        self.slot(&self.values, position, group)
    }

    fn slot<'a>(&self, data: &'a [f32], position: usize, group: usize) -> &'a [f32] {
        assert!(position < self.len, "Position {position} is not cached, the cache holds {} positions", self.len);
        assert!(group < self.group_count, "Group {group} is out of range");

        let start = position * self.entry_size() + group * self.head_size;
        &data[start..start + self.head_size]
    }

    /// Forgets every position; reserved memory is kept for the next session.
    pub fn clear(&mut self) {
        self.keys.clear();
        self.values.clear();
        self.len = 0;
    }
}

impl std::fmt::Debug for KvCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvCache")
            .field("groups", &self.group_count)
            .field("head_size", &self.head_size)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Which dimension pairs a rotary embedding rotates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotaryStyle {
    /// Pairs `(2i, 2i + 1)`, as in GPT-J.
    Adjacent,
    /// Pairs `(i, i + rotary_dim / 2)`, as in GPT-NeoX and LLaMA.
    HalfSplit,
}

/// Rotary Position Embedding (RoPE) - relative position encoding mechanism
///
/// Rotates pairs of query/key dimensions by `position * inv_freq[i]`, where
/// `inv_freq[i] = theta^(-2i / rotary_dim)`. Dimensions past `rotary_dim` are left as is.
pub struct RotaryEmbedding {
    pub style: RotaryStyle,
    pub rotary_dim: usize,
    pub inv_freq: Vec<f32>,
}

impl RotaryEmbedding {
    pub fn new(style: RotaryStyle, rotary_dim: usize, theta: f32) -> Self {
        let inv_freq = (0..rotary_dim / 2).map(|i| theta.powf(-((2 * i) as f32) / rotary_dim as f32)).collect();
        Self { style, rotary_dim, inv_freq }
    }

    /// Uses frequencies shipped with the checkpoint instead of computed ones.
    pub fn with_frequencies(style: RotaryStyle, rotary_dim: usize, inv_freq: Vec<f32>) -> Self {
        assert_eq!(inv_freq.len(), rotary_dim / 2, "Rotary frequencies must hold {} values", rotary_dim / 2);
        Self { style, rotary_dim, inv_freq }
    }

    /// Rotates a single head vector in place.
    pub fn apply(&self, head: &mut [f32], position: usize) {
        debug_assert!(head.len() >= self.rotary_dim);
        let half = self.rotary_dim / 2;

        for (i, &freq) in self.inv_freq.iter().enumerate() {
            let angle = position as f32 * freq;
            let (sin, cos) = angle.sin_cos();

            let (first, second) = match self.style {
                RotaryStyle::Adjacent => (2 * i, 2 * i + 1),
                RotaryStyle::HalfSplit => (i, i + half),
            };

            let x = head[first];
            let y = head[second];
            head[first] = x * cos - y * sin;
            head[second] = x * sin + y * cos;
        }
    }
}

impl std::fmt::Debug for RotaryEmbedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotaryEmbedding").field("style", &self.style).field("rotary_dim", &self.rotary_dim).finish()
    }
}

/// ALiBi head slopes: a geometric sequence for the closest power of two, followed by
/// the interleaved slopes of the next power of two for the remaining heads.
pub fn alibi_slopes(head_count: usize) -> Vec<f32> {
    if head_count == 0 {
        return Vec::new();
    }

    let closest = 1usize << head_count.ilog2();
    let base = 2f64.powf(-8.0 / closest as f64);
    let mut slopes = (1..=closest).map(|power| base.powi(power as i32) as f32).collect::<Vec<_>>();

    if closest != head_count {
        let extra_base = 2f64.powf(-4.0 / closest as f64);
        let remaining = (head_count - closest).min(closest);
        slopes.extend((0..remaining).map(|i| extra_base.powi((2 * i + 1) as i32) as f32));
    }

    slopes
}

/// How positions influence attention beyond the additive embeddings.
#[derive(Debug)]
pub enum PositionEncoding {
    None,
    Rotary(RotaryEmbedding),
    /// One slope per query head.
    Alibi(Vec<f32>),
}

/// Scaled dot-product attention over a key/value cache, with optional grouped heads.
///
/// **Attention Formula**:
/// ```text
/// Attention(Q,K,V) = softmax((QK^T - penalty) / dividend)V
/// ```
/// Query head `h` reads the cache entries of group `h % kv_head_count`.
#[derive(Debug)]
pub struct Attention {
    pub head_count: usize,
    pub kv_head_count: usize,
    pub head_size: usize,
    /// Divisor of raw scores, `sqrt(head_size)` unless the architecture has none.
    pub dividend: Option<f32>,
    /// Number of most recent positions attended, all of them when `None`.
    pub window: Option<usize>,
    pub positions: PositionEncoding,
    pub cache: KvCache,
}

impl Attention {
    pub fn new(head_count: usize, kv_head_count: usize, head_size: usize, context_size: Option<usize>) -> Self {
        Self {
            head_count,
            kv_head_count,
            head_size,
            dividend: Some((head_size as f32).sqrt()),
            window: None,
            positions: PositionEncoding::None,
            cache: KvCache::new(kv_head_count, head_size, context_size),
        }
    }

    pub fn without_dividend(mut self) -> Self {
        self.dividend = None;
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_positions(mut self, positions: PositionEncoding) -> Self {
        self.positions = positions;
        self
    }

    pub fn cached_positions(&self) -> usize {
        self.cache.len()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Caches the projected key/value of the next position and attends to the cache.
    ///
    /// `query` holds `head_count` heads, `key` and `value` hold `kv_head_count` heads.
    /// Returns the concatenated head outputs.
    pub fn attend(&mut self, mut query: Vec<f32>, mut key: Vec<f32>, value: Vec<f32>) -> Vec<f32> {
        assert_eq!(query.len(), self.head_count * self.head_size, "Query must hold {} heads", self.head_count);

        if let PositionEncoding::Rotary(rotary) = &self.positions {
            let position = self.cache.len();
            query.chunks_mut(self.head_size).for_each(|head| rotary.apply(head, position));
            key.chunks_mut(self.head_size).for_each(|head| rotary.apply(head, position));
        }

        self.cache.push(&key, &value);

        let length = self.cache.len();
        let start = self.window.map_or(0, |window| length.saturating_sub(window));

        let heads = (0..self.head_count)
            .into_par_iter()
            .map(|head| {
                let query = &query[head * self.head_size..(head + 1) * self.head_size];
                self.attend_head(head, query, start, length)
            })
            .collect::<Vec<_>>();

        tensor::flatten(&heads)
    }

    fn attend_head(&self, head: usize, query: &[f32], start: usize, length: usize) -> Vec<f32> {
        let group = head % self.kv_head_count;

        let mut scores = (start..length)
            .map(|position| {
                let mut score = dot(query, self.cache.key(position, group));
                if let PositionEncoding::Alibi(slopes) = &self.positions {
                    score -= slopes[head] * (length - 1 - position) as f32;
                }
                if let Some(dividend) = self.dividend {
                    score /= dividend;
                }
                score
            })
            .collect::<Vec<_>>();

        tensor::softmax(&mut scores);

        let mut output = vec![0.0f32; self.head_size];
        for (position, &weight) in (start..length).zip(&scores) {
            output.iter_mut().zip(self.cache.value(position, group)).for_each(|(out, &value)| *out += weight * value);
        }

        output
    }
}
