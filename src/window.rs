use crate::index::{IndexLayout, TemporalIndex};

/// One animation step's question: where is the data window and which way is
/// the clock moving. Recomputed every tick, never persisted.
#[derive(Debug, Clone, Copy)]
pub struct WindowQuery {
    /// End of the data window, in clock (unshifted) coordinates.
    pub query_time: f64,
    /// Length of the data window in seconds.
    pub history: f64,
    pub forward: bool,
    /// Per-layer calibration offset added to the clock time before any
    /// comparison against record epochs.
    pub time_shift: f64,
}

impl WindowQuery {
    pub fn new(query_time: f64, history: f64, forward: bool) -> Self {
        Self { query_time, history, forward, time_shift: 0.0 }
    }
}

/// The set of records inside a resolved window.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowState {
    /// Nothing resolved: empty index, layer loading, or cleared.
    Empty,
    /// Contiguous run of the sorted point records. Traversal is
    /// `start..end` ascending when forward, `start` down to `end`
    /// (exclusive) when backward; `limit` is the record count the bounds
    /// were resolved against.
    PointRange { start: i64, end: i64, forward: bool, limit: usize },
    /// Indices of the duration records overlapping the window.
    Durations(Vec<usize>),
}

impl WindowState {
    /// Record indices in draw order. Out-of-range bounds resolve to an
    /// empty traversal, never a panic.
    pub fn indices(&self) -> Vec<usize> {
        match self {
            WindowState::Empty => Vec::new(),
            WindowState::Durations(hits) => hits.clone(),
            WindowState::PointRange { start, end, forward, limit } => {
                let (start, end, limit) = (*start, *end, *limit as i64);
                if start >= limit || end >= limit {
                    return Vec::new();
                }
                if *forward {
                    (start.max(0)..end).map(|i| i as usize).collect()
                } else {
                    // Descending from start down to end, end excluded.
                    let lo = (end + 1).max(0);
                    (lo..=start).rev().map(|i| i as usize).collect()
                }
            }
        }
    }

    pub fn count(&self) -> usize {
        self.indices().len()
    }
}

/// Outcome of resolving a window against an index.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub window: WindowState,
    /// When the window is empty: the clock time (unshifted) at which this
    /// layer next has data, honoring direction. `0.0` means the window has
    /// data, or no hint applies; proceed normally.
    pub next_data_time: f64,
}

impl Resolution {
    pub fn empty() -> Self {
        Self { window: WindowState::Empty, next_data_time: 0.0 }
    }

    pub fn has_data(&self) -> bool {
        self.window.count() > 0
    }
}

/// Resolve a time window to the visible record range of `index`.
///
/// Queries against an empty index return an empty resolution rather than
/// failing; gap hints are reported in clock coordinates (time shift already
/// removed).
pub fn resolve(index: &TemporalIndex, query: &WindowQuery) -> Resolution {
    let t = query.query_time + query.time_shift;
    let window_start = t - query.history;

    match index.layout() {
        IndexLayout::Duration => resolve_duration(index, query, t, window_start),
        IndexLayout::Point => resolve_point(index, query, t, window_start),
    }
}

// --- DURATION LAYOUT ---
//
// Interval overlap over the flat pair array. A whole-array scan: duration
// layers are expected to be much smaller than point layers, and the overlap
// predicate does not admit the chunked two-level search.

fn resolve_duration(
    index: &TemporalIndex,
    query: &WindowQuery,
    t: f64,
    window_start: f64,
) -> Resolution {
    let durations = index.durations();
    if durations.is_empty() {
        return Resolution::empty();
    }

    let hits: Vec<usize> = durations
        .iter()
        .enumerate()
        .filter(|&(_, &(start, end))| end >= window_start && start <= t)
        .map(|(i, _)| i)
        .collect();

    if !hits.is_empty() {
        return Resolution { window: WindowState::Durations(hits), next_data_time: 0.0 };
    }

    let ndt = if query.forward {
        // Earliest interval still ahead of the window start; with the array
        // in epoch order the first match has the smallest epoch.
        match durations.iter().find(|&&(_, end)| end >= window_start) {
            Some(&(start, _)) => start,
            // All data behind us: the end of the temporally-last record.
            None => durations[durations.len() - 1].1,
        }
    } else {
        // Intervals starting at or before t form a prefix of the sorted
        // array; the hint is the latest end among them.
        let cut = durations.partition_point(|&(start, _)| start <= t);
        match durations[..cut]
            .iter()
            .map(|&(_, end)| end)
            .max_by(|a, b| a.total_cmp(b))
        {
            Some(end) => end,
            None => durations[0].0,
        }
    };

    Resolution {
        window: WindowState::Empty,
        next_data_time: ndt - query.time_shift,
    }
}

// --- POINT LAYOUT ---

fn resolve_point(
    index: &TemporalIndex,
    query: &WindowQuery,
    t: f64,
    window_start: f64,
) -> Resolution {
    let chunks = index.chunks();
    if chunks.is_empty() {
        return Resolution::empty();
    }
    let chunk_last = index.chunk_last();
    let chunk_limit = chunks.len();

    // Coarse search: which chunks hold the window edges.
    let mut start_chunk = chunk_last.partition_point(|&e| e < window_start);
    let mut end_chunk = chunk_last.partition_point(|&e| e <= t);
    if start_chunk >= chunk_limit {
        start_chunk = chunk_limit - 1;
    }
    if end_chunk >= chunk_limit {
        end_chunk = chunk_limit - 1;
    }

    // Fine search inside the edge chunks. Backward traversal swaps the
    // chunk roles and steps descending with both offsets pulled back one.
    let start_index: i64;
    let end_index: i64;
    if query.forward {
        start_index = chunks[start_chunk].partition_point(|&e| e < window_start) as i64;
        end_index = chunks[end_chunk].partition_point(|&e| e <= t) as i64;
    } else {
        end_index = chunks[start_chunk].partition_point(|&e| e < window_start) as i64 - 1;
        start_index = chunks[end_chunk].partition_point(|&e| e <= t) as i64 - 1;
        std::mem::swap(&mut start_chunk, &mut end_chunk);
    }

    // Equal offsets inside one chunk mean the window may be empty; hint the
    // single nearest record, clamped to the chunk bounds.
    let mut next_data_time = 0.0;
    if start_index == end_index && start_chunk == end_chunk {
        let chunk = &chunks[start_chunk];
        let top = chunk.len() as i64 - 1;
        let mut next = start_index.min(top);
        if !query.forward && start_index > 0 {
            next -= 1;
        }
        let next = next.clamp(0, top) as usize;
        next_data_time = chunk[next] - query.time_shift;
    }

    // Chunk-local offsets to global record indices.
    let chunk_size = index.chunk_size() as i64;
    let window = WindowState::PointRange {
        start: start_index + start_chunk as i64 * chunk_size,
        end: end_index + end_chunk as i64 * chunk_size,
        forward: query.forward,
        limit: index.len(),
    };

    Resolution { window, next_data_time }
}
