use crate::config::{self, EccConfig, FrameConfig};

/// The byte range of one frame's payload slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpan {
    pub index: u32,
    pub start: usize,
    pub end: usize,
}

/// Frame capacities and count for a payload under a given configuration.
#[derive(Debug, Clone, Copy)]
pub struct FramePlan {
    pub capacity_first: usize,
    pub capacity_rest: usize,
    pub total_frames: usize,
}

impl FramePlan {
    pub fn new(frame_cfg: FrameConfig, ecc_cfg: EccConfig, payload_len: usize) -> Self {
        let capacity_first = frame_cfg.capacity_per_frame(ecc_cfg, true);
        let capacity_rest = frame_cfg.capacity_per_frame(ecc_cfg, false);
        FramePlan {
            capacity_first,
            capacity_rest,
            total_frames: config::total_frames(payload_len, capacity_first, capacity_rest),
        }
    }

    /// Payload range carried by frame `index`. Frame 0 takes the first
    /// `capacity_first` bytes; later frames take `capacity_rest` each, the
    /// last one shorter.
    pub fn span(&self, index: usize, payload_len: usize) -> FrameSpan {
        let (start, end) = if index == 0 {
            (0, self.capacity_first.min(payload_len))
        } else {
            let start = self.capacity_first + (index - 1) * self.capacity_rest;
            if start >= payload_len {
                (payload_len, payload_len)
            } else {
                (start, (start + self.capacity_rest).min(payload_len))
            }
        };
        FrameSpan {
            index: index as u32,
            start,
            end,
        }
    }

    /// All frame spans in order.
    pub fn spans(&self, payload_len: usize) -> Vec<FrameSpan> {
        (0..self.total_frames)
            .map(|i| self.span(i, payload_len))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Redundancy;

    fn plan(payload_len: usize) -> FramePlan {
        FramePlan::new(
            FrameConfig::default(),
            EccConfig::new(Redundancy::Medium),
            payload_len,
        )
    }

    #[test]
    fn test_single_frame_payload() {
        let p = plan(11);
        assert_eq!(p.total_frames, 1);
        assert_eq!(p.span(0, 11), FrameSpan { index: 0, start: 0, end: 11 });
    }

    #[test]
    fn test_exact_first_frame_capacity() {
        let p = plan(242);
        assert_eq!(p.capacity_first, 242);
        assert_eq!(p.total_frames, 1);
        assert_eq!(p.span(0, 242).end, 242);
    }

    #[test]
    fn test_spans_cover_payload_without_overlap() {
        let len = 242 + 262 + 1;
        let p = plan(len);
        assert_eq!(p.total_frames, 3);

        let spans = p.spans(len);
        assert_eq!(spans[0], FrameSpan { index: 0, start: 0, end: 242 });
        assert_eq!(spans[1], FrameSpan { index: 1, start: 242, end: 504 });
        assert_eq!(spans[2], FrameSpan { index: 2, start: 504, end: 505 });

        let covered: usize = spans.iter().map(|s| s.end - s.start).sum();
        assert_eq!(covered, len);
    }

    #[test]
    fn test_empty_payload_is_one_frame() {
        let p = plan(0);
        assert_eq!(p.total_frames, 1);
        let span = p.span(0, 0);
        assert_eq!(span.end - span.start, 0);
    }
}
