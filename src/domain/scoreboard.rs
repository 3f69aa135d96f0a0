//! Score / Timer Model
//!
//! Holds the scores and countdown timer the client believes the scoreboard
//! is showing. All fields stay inside their display ranges at all times.

use crate::domain::models::{ConnectionStatus, Side};
use crate::infrastructure::bluetooth::protocol::{
    self, CommandFlags, CommandPacket, MAX_SCORE, MAX_TIMER_MINUTES, MAX_TIMER_SECONDS,
};

/// Scores and timer as last set by the user
///
/// A timer of 00:00 doubles as "score display mode". A stopped timer and a
/// timer that just ran out cannot be told apart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScoreboardState {
    pub blue_score: u8,
    pub red_score: u8,
    pub timer_minutes: u8,
    pub timer_seconds: u8,
    pub connection_status: ConnectionStatus,
    pub connected_device_id: Option<String>,
    force_redraw_pending: bool,
}

impl ScoreboardState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score(&self, side: Side) -> u8 {
        match side {
            Side::Blue => self.blue_score,
            Side::Red => self.red_score,
        }
    }

    fn score_mut(&mut self, side: Side) -> &mut u8 {
        match side {
            Side::Blue => &mut self.blue_score,
            Side::Red => &mut self.red_score,
        }
    }

    /// Add `amount`, wrapping past 99 back to 0
    pub fn increment_score(&mut self, side: Side, amount: u8) -> u8 {
        let score = self.score_mut(side);
        *score = protocol::wrap_score(*score as u32 + amount as u32);
        *score
    }

    /// Subtract one. Returns false (and changes nothing) when already at 0.
    pub fn decrement_score(&mut self, side: Side) -> bool {
        let score = self.score_mut(side);
        if *score == 0 {
            return false;
        }
        *score -= 1;
        self.force_redraw_pending = true;
        true
    }

    /// Set directly, clamping to 99
    pub fn set_score(&mut self, side: Side, value: u8) -> u8 {
        let score = self.score_mut(side);
        *score = value.min(MAX_SCORE);
        *score
    }

    pub fn start_timer(&mut self, minutes: u8, seconds: u8) {
        self.timer_minutes = minutes.min(MAX_TIMER_MINUTES);
        self.timer_seconds = seconds.min(MAX_TIMER_SECONDS);
    }

    /// Back to score display mode
    pub fn stop_timer(&mut self) {
        self.timer_minutes = 0;
        self.timer_seconds = 0;
    }

    /// Zero scores and timer
    pub fn reset(&mut self) {
        self.blue_score = 0;
        self.red_score = 0;
        self.timer_minutes = 0;
        self.timer_seconds = 0;
        self.force_redraw_pending = true;
    }

    pub fn is_timer_mode(&self) -> bool {
        self.timer_minutes > 0 || self.timer_seconds > 0
    }

    /// True when anything differs from a freshly reset board
    pub fn has_content(&self) -> bool {
        self.blue_score > 0 || self.red_score > 0 || self.is_timer_mode()
    }

    pub fn timer_formatted(&self) -> String {
        format!("{:02}:{:02}", self.timer_minutes, self.timer_seconds)
    }

    pub fn force_redraw_pending(&self) -> bool {
        self.force_redraw_pending
    }

    /// Build a packet from the current values without consuming the redraw mark
    pub fn to_packet(&self, slow_update_rate: bool, force_redraw: bool) -> CommandPacket {
        let mut flags = CommandFlags::empty();
        if slow_update_rate {
            flags |= CommandFlags::SLOW_UPDATE_RATE;
        }
        if force_redraw {
            flags |= CommandFlags::FORCE_REDRAW;
        }
        protocol::encode_command(
            self.blue_score as u32,
            self.red_score as u32,
            self.timer_minutes as u32,
            self.timer_seconds as u32,
            flags,
        )
    }

    /// Build the next outbound packet, consuming any pending redraw mark
    pub fn take_packet(&mut self, slow_update_rate: bool) -> CommandPacket {
        let force = std::mem::take(&mut self.force_redraw_pending);
        self.to_packet(slow_update_rate, force)
    }

    /// Build a full-redraw packet and clear the pending mark
    pub fn take_resync_packet(&mut self, slow_update_rate: bool) -> CommandPacket {
        self.force_redraw_pending = false;
        self.to_packet(slow_update_rate, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_wraps_modulo_100() {
        for start in 0..=99u8 {
            for amount in 1..=99u8 {
                let mut state = ScoreboardState::new();
                state.set_score(Side::Blue, start);
                let result = state.increment_score(Side::Blue, amount);
                assert_eq!(result as u32, (start as u32 + amount as u32) % 100);
            }
        }
    }

    #[test]
    fn test_decrement_stops_at_zero() {
        let mut state = ScoreboardState::new();
        assert!(!state.decrement_score(Side::Red));
        assert_eq!(state.red_score, 0);
        assert!(!state.force_redraw_pending());

        for start in 1..=99u8 {
            state.set_score(Side::Red, start);
            assert!(state.decrement_score(Side::Red));
            assert_eq!(state.red_score, start - 1);
        }
    }

    #[test]
    fn test_set_score_clamps_instead_of_wrapping() {
        let mut state = ScoreboardState::new();
        assert_eq!(state.set_score(Side::Blue, 150), 99);
        assert_eq!(state.set_score(Side::Red, 42), 42);
    }

    #[test]
    fn test_timer_clamps_and_stop_returns_to_score_mode() {
        let mut state = ScoreboardState::new();
        state.start_timer(120, 75);
        assert_eq!((state.timer_minutes, state.timer_seconds), (99, 59));
        assert!(state.is_timer_mode());
        assert_eq!(state.timer_formatted(), "99:59");

        state.stop_timer();
        assert!(!state.is_timer_mode());
        assert_eq!(state.timer_formatted(), "00:00");
    }

    #[test]
    fn test_reset_zeroes_everything_and_marks_redraw() {
        let mut state = ScoreboardState::new();
        state.set_score(Side::Blue, 12);
        state.set_score(Side::Red, 7);
        state.start_timer(5, 0);
        state.reset();

        assert_eq!(state.blue_score, 0);
        assert_eq!(state.red_score, 0);
        assert!(!state.is_timer_mode());
        assert!(state.force_redraw_pending());
    }

    #[test]
    fn test_redraw_flag_only_on_stale_segment_operations() {
        let mut state = ScoreboardState::new();
        state.increment_score(Side::Blue, 2);
        let packet = state.take_packet(false);
        assert!(!packet.flags().contains(CommandFlags::FORCE_REDRAW));

        state.decrement_score(Side::Blue);
        let packet = state.take_packet(false);
        assert!(packet.flags().contains(CommandFlags::FORCE_REDRAW));

        // mark is consumed by the packet that carried it
        state.increment_score(Side::Blue, 1);
        let packet = state.take_packet(true);
        assert_eq!(packet.flags(), CommandFlags::SLOW_UPDATE_RATE);
    }
}
