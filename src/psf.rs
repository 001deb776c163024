//! Point-spread function, convolution kernel and aperture-correction models.

use ndarray::Array2;

/// Full width at half maximum of a Gaussian in units of its sigma, 2√(2 ln 2).
pub const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949_3;

/// A centred, odd-sized convolution kernel. Indexed `[row, col]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    pub image: Array2<f64>,
}

impl Kernel {
    /// Wrap a kernel image. Even dimensions are padded by one row/column of
    /// zeros so that the kernel has a well-defined centre pixel.
    pub fn new(image: Array2<f64>) -> Kernel {
        let (h, w) = image.dim();
        if h % 2 == 1 && w % 2 == 1 {
            return Kernel { image };
        }
        let mut padded = Array2::zeros((h | 1, w | 1));
        for ((r, c), &v) in image.indexed_iter() {
            padded[[r, c]] = v;
        }
        Kernel { image: padded }
    }

    /// A normalised, circular Gaussian kernel.
    pub fn gaussian(width: usize, height: usize, sigma: f64) -> Kernel {
        let width = width | 1;
        let height = height | 1;
        let (cx, cy) = ((width / 2) as f64, (height / 2) as f64);
        let mut image = Array2::from_shape_fn((height, width), |(r, c)| {
            let dx = c as f64 - cx;
            let dy = r as f64 - cy;
            (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
        });
        let sum = image.sum();
        image /= sum;
        Kernel { image }
    }

    /// The identity kernel.
    pub fn delta() -> Kernel {
        Kernel {
            image: Array2::from_elem((1, 1), 1.0),
        }
    }

    /// (width, height)
    pub fn dimensions(&self) -> (usize, usize) {
        let (h, w) = self.image.dim();
        (w, h)
    }

    /// (x, y) of the centre pixel.
    pub fn center(&self) -> (usize, usize) {
        let (w, h) = self.dimensions();
        (w / 2, h / 2)
    }

    pub fn sum(&self) -> f64 {
        self.image.sum()
    }

    pub fn scaled(mut self, factor: f64) -> Kernel {
        self.image *= factor;
        self
    }

    /// (sum, xx, yy, xy) about the kernel centre, optionally with a circular
    /// Gaussian weight.
    fn moments(&self, weight_sigma: Option<f64>) -> (f64, f64, f64, f64) {
        let (cx, cy) = self.center();
        let (mut sum, mut xx, mut yy, mut xy) = (0.0, 0.0, 0.0, 0.0);
        for ((r, c), &v) in self.image.indexed_iter() {
            let dx = c as f64 - cx as f64;
            let dy = r as f64 - cy as f64;
            let w = match weight_sigma {
                Some(s) => (-(dx * dx + dy * dy) / (2.0 * s * s)).exp(),
                None => 1.0,
            };
            let v = v * w;
            sum += v;
            xx += v * dx * dx;
            yy += v * dy * dy;
            xy += v * dx * dy;
        }
        (sum, xx, yy, xy)
    }
}

/// A PSF model. Models are evaluated at the centre of the image they belong
/// to; spatial variation is not represented.
#[derive(Debug, Clone, PartialEq)]
pub enum Psf {
    SingleGaussian {
        width: usize,
        height: usize,
        sigma: f64,
    },

    /// Core Gaussian plus a wider wing Gaussian whose peak is `b` times the
    /// core peak.
    DoubleGaussian {
        width: usize,
        height: usize,
        sigma1: f64,
        sigma2: f64,
        b: f64,
    },

    /// A fitted, pixelised PSF.
    Image(Kernel),
}

impl Psf {
    /// (width, height) of the kernel image.
    pub fn kernel_dimensions(&self) -> (usize, usize) {
        match self {
            Psf::SingleGaussian { width, height, .. }
            | Psf::DoubleGaussian { width, height, .. } => (*width | 1, *height | 1),
            Psf::Image(k) => k.dimensions(),
        }
    }

    /// The normalised kernel image of this PSF.
    pub fn kernel(&self) -> Kernel {
        match self {
            Psf::SingleGaussian {
                width,
                height,
                sigma,
            } => Kernel::gaussian(*width, *height, *sigma),

            Psf::DoubleGaussian {
                width,
                height,
                sigma1,
                sigma2,
                b,
            } => {
                let core = Kernel::gaussian(*width, *height, *sigma1);
                let wing = Kernel::gaussian(*width, *height, *sigma2);
                // Peak amplitudes of the normalised Gaussians scale as 1/σ².
                let wing_weight = b * (sigma2 * sigma2) / (sigma1 * sigma1);
                let mut image = core.image + &(wing.image * wing_weight);
                let sum = image.sum();
                image /= sum;
                Kernel { image }
            }

            Psf::Image(k) => {
                let sum = k.sum();
                if sum.abs() > 0.0 {
                    k.clone().scaled(1.0 / sum)
                } else {
                    k.clone()
                }
            }
        }
    }

    /// Gaussian sigma \[pixels\] from adaptive second moments of the kernel
    /// image. A single Gaussian reports its own sigma.
    pub fn compute_gaussian_width(&self) -> f64 {
        if let Psf::SingleGaussian { sigma, .. } = self {
            return *sigma;
        }

        let kernel = self.kernel();
        let (sum, xx, yy, _) = kernel.moments(None);
        let mut sigma = if sum > 0.0 {
            (0.5 * (xx + yy) / sum).max(0.0).sqrt()
        } else {
            1.0
        };
        // For a Gaussian of width σ and a Gaussian weight of width σ_w, the
        // weighted second moment is σ²σ_w²/(σ²+σ_w²); its fixed point is σ_w = σ.
        for _ in 0..50 {
            let (sum, xx, yy, _) = kernel.moments(Some(sigma));
            if sum <= 0.0 {
                break;
            }
            let m = 0.5 * (xx + yy) / sum;
            let next = (2.0 * m).max(0.0).sqrt();
            if (next - sigma).abs() < 1e-9 {
                sigma = next;
                break;
            }
            sigma = next;
        }
        sigma
    }

    pub fn fwhm(&self) -> f64 {
        self.compute_gaussian_width() * FWHM_PER_SIGMA
    }
}

/// A multiplicative aperture correction for PSF fluxes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApertureCorrection {
    pub value: f64,
    pub error: f64,
}

impl ApertureCorrection {
    pub fn apply(&self, flux: f64) -> f64 {
        flux * self.value
    }
}
