//! Bounded retry.

/// The outcome of a single attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trial<T, G> {
    /// Done, with a result.
    Decided(T),
    /// Not yet; `G` is the best guess so far.
    Undecided(G),
}

/// Returned by [converge] when the ceiling was crossed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Exhausted<G> {
    /// Number of attempts made (always `ceiling + 1`).
    pub trials: usize,
    /// The guess from the last attempt.
    pub last: G,
}

/// Repeat `attempt` until it decides.
///
/// The trial counter starts at zero and is incremented after every
/// undecided attempt; once it exceeds `ceiling` we give up. In other words
/// exactly `ceiling + 1` undecided attempts are tolerated before failing.
/// `attempt` is passed the number of attempts made so far.
pub fn converge<T, G>(ceiling: usize, mut attempt: impl FnMut(usize) -> Trial<T, G>)
    -> Result<T, Exhausted<G>>
{
    let mut trials = 0;
    loop {
        match attempt(trials) {
            Trial::Decided(res) => return Ok(res),
            Trial::Undecided(last) => {
                trials += 1;
                if trials > ceiling {
                    return Err(Exhausted { trials, last });
                }
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_attempt() {
        let mut calls = 0;
        let res: Result<u8, Exhausted<u8>> = converge(10, |_| {
            calls += 1;
            Trial::Decided(0x41)
        });
        assert_eq!(res, Ok(0x41));
        assert_eq!(calls, 1);
    }

    #[test]
    fn decides_late() {
        let res: Result<usize, Exhausted<()>> = converge(10, |n| {
            if n == 10 { Trial::Decided(n) } else { Trial::Undecided(()) }
        });
        assert_eq!(res, Ok(10));
    }

    #[test]
    fn exhausted_at_ceiling_plus_one() {
        for ceiling in [0, 1, 7, 100] {
            let mut calls = 0;
            let res: Result<(), Exhausted<usize>> = converge(ceiling, |n| {
                calls += 1;
                Trial::Undecided(n)
            });
            assert_eq!(res, Err(Exhausted { trials: ceiling + 1, last: ceiling }));
            assert_eq!(calls, ceiling + 1);
        }
    }
}
