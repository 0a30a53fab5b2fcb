use std::time::Duration;

use arena_sync::InputState;

const LEG: Duration = Duration::from_millis(1500);
const PAUSE: Duration = Duration::from_millis(500);

/// Walks a square with a short pause at each corner.
pub fn input_at(elapsed: Duration) -> InputState {
    const LEGS: [InputState; 4] = [
        InputState::RIGHT,
        InputState::DOWN,
        InputState::LEFT,
        InputState::UP,
    ];

    let cycle = (LEG + PAUSE).as_millis() * LEGS.len() as u128;
    let t = elapsed.as_millis() % cycle;
    let leg = (t / (LEG + PAUSE).as_millis()) as usize;
    let within = t % (LEG + PAUSE).as_millis();

    if within < LEG.as_millis() {
        LEGS[leg]
    } else {
        InputState::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_square_pattern() {
        assert_eq!(input_at(Duration::ZERO), InputState::RIGHT);
        assert_eq!(input_at(Duration::from_millis(1700)), InputState::empty());
        assert_eq!(input_at(Duration::from_millis(2100)), InputState::DOWN);
        assert_eq!(input_at(Duration::from_millis(6100)), InputState::UP);
        assert_eq!(input_at(Duration::from_millis(8000)), InputState::RIGHT);
    }
}
