#![allow(dead_code)]

use nalgebra::DMatrix;
use panacea::{
    amplifier::{Amplifier, FrameHeader},
    calibration::library::MemoryLibrary,
    params::ReductionParams,
};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

pub const OVERSCAN_COLS: usize = 8;
pub const BIAS_LEVEL: f64 = 1000.0;
pub const READ_NOISE: f64 = 3.0;
pub const REF_DATE: &str = "20170301";

/// Absorption lines of the synthetic solar-like template: `(centre, depth, sigma)`.
pub fn absorption_lines() -> Vec<(f64, f64, f64)> {
    (0..60)
        .map(|k| {
            let k = k as f64;
            let centre = 3420.0 + 13.7 * k + 4.0 * (1.7 * k).sin();
            let depth = 0.2 + 0.5 * (0.9 * k).sin().abs();
            (centre, depth, 2.5)
        })
        .collect()
}

pub fn solar(wavelength: f64) -> f64 {
    let continuum = 1.0 + 0.2 * ((wavelength - 3400.0) / 800.0);
    absorption_lines()
        .into_iter()
        .fold(continuum, |acc, (c, depth, s)| {
            acc * (1.0 - depth * (-0.5 * ((wavelength - c) / s).powi(2)).exp())
        })
}

/// Sky emission: a flat continuum plus a few bright lines.
pub fn sky(wavelength: f64) -> f64 {
    [(3650.0, 40.0), (3820.0, 25.0), (3955.0, 60.0)]
        .into_iter()
        .fold(20.0, |acc, (c, amp)| {
            acc + amp * (-0.5 * ((wavelength - c) / 3.0f64).powi(2)).exp()
        })
}

/// Synthetic amplifier frame: tilted Gaussian fibers over an overscan pedestal.
#[derive(Debug, Clone)]
pub struct SyntheticFrame {
    pub nfibers: usize,
    pub columns: usize,
    pub spacing: f64,
    pub first_row: f64,
    /// Trace slope, rows per column.
    pub tilt: f64,
    pub sigma: f64,
    pub wave_start: f64,
    pub dispersion: f64,
    pub level: f64,
    pub throughput: Vec<f64>,
    /// Fibers left out of the image.
    pub missing: Vec<usize>,
    pub imagetyp: &'static str,
    pub noise_seed: Option<u64>,
}

impl SyntheticFrame {
    pub fn new(nfibers: usize, columns: usize) -> Self {
        SyntheticFrame {
            nfibers,
            columns,
            spacing: 8.0,
            first_row: 12.0,
            tilt: 0.05,
            sigma: 1.7,
            wave_start: 3500.0,
            dispersion: 2.0,
            level: 3000.0,
            throughput: (0..nfibers)
                .map(|i| 0.9 + 0.05 * ((i * 7) % 5) as f64)
                .collect(),
            missing: Vec::new(),
            imagetyp: "twi",
            noise_seed: Some(42),
        }
    }

    pub fn science(mut self) -> Self {
        self.imagetyp = "sci";
        self
    }

    pub fn rows(&self) -> usize {
        (self.first_row + self.spacing * self.nfibers as f64 + self.tilt * self.columns as f64)
            .ceil() as usize
            + 8
    }

    pub fn centre(&self, fiber: usize, col: usize) -> f64 {
        self.first_row + self.spacing * fiber as f64 + self.tilt * col as f64
    }

    pub fn wavelength(&self, col: usize) -> f64 {
        self.wave_start + self.dispersion * col as f64
    }

    pub fn wave_end(&self) -> f64 {
        self.wavelength(self.columns - 1)
    }

    /// Flux deposited by `fiber` at `col`.
    pub fn flux(&self, fiber: usize, col: usize) -> f64 {
        let w = self.wavelength(col);
        let source = if self.imagetyp == "sci" { sky(w) } else { solar(w) };
        self.level * self.throughput[fiber] * source
    }

    /// Calibrated image, without overscan, noise or pedestal.
    pub fn clean_image(&self) -> DMatrix<f64> {
        let norm = 1.0 / (self.sigma * (2.0 * std::f64::consts::PI).sqrt());
        let mut image = DMatrix::<f64>::zeros(self.rows(), self.columns);
        for f in (0..self.nfibers).filter(|f| !self.missing.contains(f)) {
            for c in 0..self.columns {
                let y0 = self.centre(f, c);
                let amp = self.flux(f, c) * norm;
                let lo = (y0 - 6.0 * self.sigma).floor().max(0.0) as usize;
                let hi = ((y0 + 6.0 * self.sigma).ceil() as usize).min(self.rows() - 1);
                for r in lo..=hi {
                    image[(r, c)] += amp * (-0.5 * ((r as f64 - y0) / self.sigma).powi(2)).exp();
                }
            }
        }
        image
    }

    /// Raw frame with the overscan strip on the right.
    pub fn raw(&self) -> DMatrix<f64> {
        let clean = self.clean_image();
        let (n, d) = clean.shape();
        let mut raw = DMatrix::from_fn(n, d + OVERSCAN_COLS, |r, c| {
            BIAS_LEVEL + if c < d { clean[(r, c)] } else { 0.0 }
        });
        if let Some(seed) = self.noise_seed {
            let mut rng = StdRng::seed_from_u64(seed);
            let normal = Normal::new(0.0, READ_NOISE).unwrap();
            raw.iter_mut().for_each(|v| *v += normal.sample(&mut rng));
        }
        raw
    }

    pub fn cards(&self) -> Vec<(String, String)> {
        let (n, d) = (self.rows(), self.columns);
        [
            ("GAIN", "1.0".to_string()),
            ("RDNOISE", READ_NOISE.to_string()),
            ("CCDPOS", "L".into()),
            ("CCDHALF", "L".into()),
            ("TRIMSEC", format!("'[1:{d},1:{n}]'")),
            ("BIASSEC", format!("'[{}:{},1:{n}]'", d + 1, d + OVERSCAN_COLS)),
            ("IMAGETYP", self.imagetyp.into()),
            ("SPECID", "83".into()),
            ("IFUID", "'004 '".into()),
            ("IFUSLOT", "75".into()),
            ("DATE-OBS", "2017-03-15".into()),
            ("EXPTIME", "60.0".into()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader::from_cards(self.cards()).unwrap()
    }

    pub fn amplifier(&self) -> Amplifier {
        Amplifier::new(self.header(), self.raw()).unwrap()
    }

    /// Fiber rows at `col` for every fiber, missing ones included.
    pub fn positions_at(&self, col: usize) -> Vec<f64> {
        (0..self.nfibers).map(|f| self.centre(f, col)).collect()
    }

    /// Library with a zero dark, a flat pixel flat, the reference template and the
    /// fiber positions at `ref_col`.
    pub fn library(&self, ref_col: usize) -> MemoryLibrary {
        let header = self.header();
        let ctx = &header.context;
        let (n, d) = (self.rows(), self.columns);
        let mut library = MemoryLibrary::default();
        library.insert_dark(&ctx.specid, &ctx.amp, DMatrix::zeros(n, d));
        library.insert_flat(&ctx.specid, &ctx.amp, DMatrix::from_element(n, d, 1.0));
        library.insert_locations(REF_DATE, ctx, self.positions_at(ref_col));
        let wave: Vec<f64> = (0..6000).map(|k| 3300.0 + 0.5 * k as f64).collect();
        let flux: Vec<f64> = wave.iter().map(|&w| 3.0 * solar(w)).collect();
        library.set_reference_spectrum(wave, flux);
        library
    }

    /// Parameters for this frame.
    pub fn params(&self) -> ReductionParams {
        ReductionParams::builder()
            .init_lims(self.wave_start, self.wave_end())
            .sigma(self.sigma)
            .col_group(8)
            .fiber_group(6)
            .filt_size_agg(31)
            .filt_size_final(31)
            .filt_size_sky(31)
            .build()
            .unwrap()
    }
}
