//! Flat per-voice parameter pool and the modulation routing table.
//!
//! The voice keeps two copies of its parameters: the base values set by the
//! patch, and a per-block working copy onto which modulation routes are
//! accumulated. Routes are applied in list order; there is no commutation
//! guarantee beyond plain summation.

use std::ops::{Index, IndexMut};

/// Stable destination ids for every modulatable voice parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Dest {
    /// Voice output level, perceptual amp taper.
    Volume,
    /// Pan position in [-1, 1].
    Pan,
    /// Stereo width for the stereo/wide topologies, added to/subtracted
    /// from pan for the two output pairs.
    Width,
    /// Pre-filter gain in dB, applied to the assembled lane input.
    PreFilterGain,
    /// Post-chain VCA gain in dB, before the amp envelope multiply.
    VcaGain,
    /// dB attenuation applied in full at zero velocity, none at full.
    VcaVelSense,
    /// Pitch offset in semitones on top of key, bend and octave.
    Pitch,
    /// Portamento time, log2 seconds.
    PortamentoTime,
    OscLevel1,
    OscLevel2,
    OscLevel3,
    RingLevel12,
    RingLevel23,
    NoiseLevel,
    /// Noise correlation in [-1, 1]; negative brightens.
    NoiseColor,
    /// FM depth in dB for the configured FM routing.
    FmDepth,
    /// Filter A cutoff in MIDI note units (69 = 440 Hz).
    CutoffA,
    ResonanceA,
    /// Filter B cutoff; an offset from A's final cutoff when the offset
    /// option is set.
    CutoffB,
    ResonanceB,
    /// Filter-envelope depth in semitones of cutoff.
    EnvModDepth,
    /// Filter A/B balance in [-1, 1], mapped to the chain's two mixes.
    FilterBalance,
    /// Chain feedback amount.
    Feedback,
    /// Waveshaper drive in dB.
    WaveshaperDrive,
}

pub const N_DESTS: usize = Dest::WaveshaperDrive as usize + 1;

/// The flat parameter array, indexable by [`Dest`].
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParamPool {
    values: [f32; N_DESTS],
}

impl Default for ParamPool {
    fn default() -> Self {
        let mut p = Self {
            values: [0.0; N_DESTS],
        };
        p[Dest::Volume] = 1.0;
        p[Dest::OscLevel1] = 1.0;
        p[Dest::CutoffA] = 100.0;
        p[Dest::CutoffB] = 100.0;
        p[Dest::PortamentoTime] = crate::modulation::envelope::ENV_TIME_MIN;
        p
    }
}

impl Index<Dest> for ParamPool {
    type Output = f32;

    #[inline]
    fn index(&self, d: Dest) -> &f32 {
        &self.values[d as usize]
    }
}

impl IndexMut<Dest> for ParamPool {
    #[inline]
    fn index_mut(&mut self, d: Dest) -> &mut f32 {
        &mut self.values[d as usize]
    }
}

/// Modulation source id as referenced by a route. LFO and controller
/// indices past the voice's capacity contribute zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RouteSource {
    AmpEg,
    FilterEg,
    Lfo(usize),
    /// Shared monophonic controller, read from the smoothed value the host
    /// passes into the block call.
    Controller(usize),
}

/// One (source, destination, depth) routing entry.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModRoute {
    pub source: RouteSource,
    pub dest: Dest,
    pub depth: f32,
    /// Muted routes still occupy their list position but contribute zero.
    pub muted: bool,
}

/// Accumulate every route onto `local` in list order.
pub fn apply_routes<F>(local: &mut ParamPool, routes: &[ModRoute], source_output: F)
where
    F: Fn(RouteSource) -> f32,
{
    for route in routes {
        let gate = if route.muted { 0.0 } else { 1.0 };
        local[route.dest] += route.depth * source_output(route.source) * gate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_accumulate_onto_the_base_value_in_order() {
        let mut local = ParamPool::default();
        let base = local[Dest::CutoffA];
        let routes = [
            ModRoute {
                source: RouteSource::FilterEg,
                dest: Dest::CutoffA,
                depth: 24.0,
                muted: false,
            },
            ModRoute {
                source: RouteSource::Controller(0),
                dest: Dest::CutoffA,
                depth: -6.0,
                muted: false,
            },
        ];
        apply_routes(&mut local, &routes, |s| match s {
            RouteSource::FilterEg => 0.5,
            RouteSource::Controller(0) => 1.0,
            _ => 0.0,
        });
        assert!((local[Dest::CutoffA] - (base + 12.0 - 6.0)).abs() < 1e-6);
    }

    #[test]
    fn muted_route_contributes_exactly_zero() {
        let mut local = ParamPool::default();
        let base = local[Dest::Pan];
        let routes = [ModRoute {
            source: RouteSource::AmpEg,
            dest: Dest::Pan,
            depth: 1.0,
            muted: true,
        }];
        apply_routes(&mut local, &routes, |_| 1.0);
        assert_eq!(local[Dest::Pan], base);
    }

    #[test]
    fn unknown_controller_reads_as_zero() {
        let mut local = ParamPool::default();
        let base = local[Dest::Volume];
        let routes = [ModRoute {
            source: RouteSource::Controller(99),
            dest: Dest::Volume,
            depth: 5.0,
            muted: false,
        }];
        let mono: [f32; 1] = [0.7];
        apply_routes(&mut local, &routes, |s| match s {
            RouteSource::Controller(i) => mono.get(i).copied().unwrap_or(0.0),
            _ => 0.0,
        });
        assert_eq!(local[Dest::Volume], base);
    }
}
