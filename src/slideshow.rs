use serde::{Deserialize, Serialize};

/// Playback position shared by every viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlideshowState {
    pub index: usize,
    pub playing: bool,
}

impl Default for SlideshowState {
    fn default() -> Self {
        Self {
            index: 0,
            playing: true,
        }
    }
}

/// Discrete control inputs. Anything unrecognized deserializes to
/// [`SlideshowAction::Unrecognized`] and leaves the state unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlideshowAction {
    Next,
    Prev,
    Toggle,
    #[serde(other)]
    Unrecognized,
}

impl SlideshowAction {
    pub fn parse(name: &str) -> Self {
        match name {
            "next" => Self::Next,
            "prev" => Self::Prev,
            "toggle" => Self::Toggle,
            _ => Self::Unrecognized,
        }
    }
}

impl SlideshowState {
    pub fn apply(&mut self, action: SlideshowAction) -> Self {
        match action {
            // Wrapping against the library size is up to the viewers.
            SlideshowAction::Next => self.index = self.index.saturating_add(1),
            SlideshowAction::Prev => self.index = self.index.saturating_sub(1),
            SlideshowAction::Toggle => self.playing = !self.playing,
            SlideshowAction::Unrecognized => {}
        }
        *self
    }

    /// Pull `index` back inside `0..max(1, image_count)`. Returns whether it moved.
    pub fn clamp_to(&mut self, image_count: usize) -> bool {
        let last = image_count.max(1) - 1;
        if self.index > last {
            self.index = last;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero_and_playing() {
        let state = SlideshowState::default();
        assert_eq!(state.index, 0);
        assert!(state.playing);
    }

    #[test]
    fn next_is_unbounded_and_prev_stops_at_zero() {
        let mut state = SlideshowState::default();
        for _ in 0..5 {
            state.apply(SlideshowAction::Next);
        }
        assert_eq!(state.index, 5);
        for _ in 0..9 {
            state.apply(SlideshowAction::Prev);
        }
        assert_eq!(state.index, 0);
    }

    #[test]
    fn toggle_flips_playing_only() {
        let mut state = SlideshowState {
            index: 3,
            playing: true,
        };
        let after = state.apply(SlideshowAction::Toggle);
        assert_eq!(
            after,
            SlideshowState {
                index: 3,
                playing: false
            }
        );
        state.apply(SlideshowAction::Toggle);
        assert!(state.playing);
    }

    #[test]
    fn unrecognized_action_is_a_no_op() {
        let mut state = SlideshowState {
            index: 4,
            playing: false,
        };
        let before = state;
        assert_eq!(state.apply(SlideshowAction::parse("rewind")), before);
    }

    #[test]
    fn deserializes_unknown_names_as_unrecognized() {
        let action: SlideshowAction = serde_json::from_str("\"shuffle\"").unwrap();
        assert_eq!(action, SlideshowAction::Unrecognized);
        let action: SlideshowAction = serde_json::from_str("\"prev\"").unwrap();
        assert_eq!(action, SlideshowAction::Prev);
    }

    #[test]
    fn clamp_respects_library_size() {
        let mut state = SlideshowState {
            index: 7,
            playing: true,
        };
        assert!(state.clamp_to(3));
        assert_eq!(state.index, 2);
        assert!(!state.clamp_to(3));
        assert!(state.clamp_to(0));
        assert_eq!(state.index, 0);
    }
}
