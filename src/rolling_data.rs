/// A rolling window over the last `capacity` samples with a cached sum, so the mean is
///  available in constant time. Starts empty and averages over however many samples
///  exist until the window is full.
pub struct RollingData {
    buf: BufferImpl,
    cached_sum: f64,
}

impl RollingData {
    pub fn new(capacity: usize) -> RollingData {
        assert!(capacity > 0);
        RollingData {
            buf: BufferImpl::new(capacity),
            cached_sum: 0.0,
        }
    }

    pub fn add_value(&mut self, value: f64) {
        if let Some(evicted) = self.buf.add_value(value) {
            self.cached_sum -= evicted;
        }
        self.cached_sum += value;
    }

    pub fn mean(&self) -> f64 {
        if self.buf.len() == 0 {
            return 0.0;
        }
        self.cached_sum / self.buf.len() as f64
    }
}

enum BufferImpl {
    Growing { buf: Vec<f64>, capacity: usize },
    Ring { buf: Vec<f64>, next: usize },
}

impl BufferImpl {
    fn new(capacity: usize) -> BufferImpl {
        BufferImpl::Growing {
            buf: vec![],
            capacity,
        }
    }

    fn len(&self) -> usize {
        match self {
            BufferImpl::Growing { buf, .. } => buf.len(),
            BufferImpl::Ring { buf, .. } => buf.len(),
        }
    }

    /// adds a new value, returning the value that was evicted in its place (if any)
    #[must_use]
    fn add_value(&mut self, value: f64) -> Option<f64> {
        match self {
            BufferImpl::Growing { buf, capacity } => {
                buf.push(value);
                if buf.len() == *capacity {
                    let buf = std::mem::take(buf);
                    *self = BufferImpl::Ring { buf, next: 0 };
                }
                None
            }
            BufferImpl::Ring { buf, next } => {
                let evicted = buf[*next];
                buf[*next] = value;
                *next = (*next + 1) % buf.len();
                Some(evicted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_mean_is_zero() {
        assert_eq!(RollingData::new(4).mean(), 0.0);
    }

    #[test]
    fn test_mean_over_partial_window() {
        let mut data = RollingData::new(4);
        data.add_value(1.0);
        assert_eq!(data.mean(), 1.0);
        data.add_value(3.0);
        assert_eq!(data.mean(), 2.0);
    }

    #[test]
    fn test_old_values_are_evicted_once_full() {
        let mut data = RollingData::new(3);
        data.add_value(9.0);
        data.add_value(3.0);
        data.add_value(3.0);
        assert_eq!(data.mean(), 5.0);

        // evicts the 9.0
        data.add_value(3.0);
        assert_eq!(data.mean(), 3.0);
    }

    #[test]
    fn test_window_of_one_tracks_the_latest_value() {
        let mut data = RollingData::new(1);
        data.add_value(7.0);
        assert_eq!(data.mean(), 7.0);
        data.add_value(2.0);
        assert_eq!(data.mean(), 2.0);
    }
}
