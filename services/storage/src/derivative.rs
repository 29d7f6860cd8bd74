use crate::image_normalizer::{normalize, NormalizeError};
use crate::store::{Store, StoreError, TEMP_PREFIX};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::fs::File;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

const DEFAULT_JPEG_QUALITY: u8 = 90;
const DEFAULT_MAX_WIDTH: u32 = 8192;
const DEFAULT_MAX_PIXELS: u64 = 8192 * 8192;

/// Errors that can occur while producing a derivative.
#[derive(Debug, thiserror::Error)]
pub enum DerivativeError {
    #[error("Invalid derivative width {width} (must be 1..={max})")]
    InvalidWidth { width: u32, max: u32 },

    #[error("Derivative {width}x{height} exceeds {max} pixels")]
    TooManyPixels { width: u32, height: u32, max: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error("Failed to encode derivative: {0}")]
    Encode(#[source] image::ImageError),

    #[error("Failed to write derivative {name}: {source}")]
    Write { name: String, source: io::Error },
}

/// Derivative output settings.
#[derive(Debug, Clone)]
pub struct DerivativeSettings {
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    /// Largest width a caller may request
    pub max_width: u32,
    /// Largest derivative area (width x height)
    pub max_pixels: u64,
}

impl Default for DerivativeSettings {
    fn default() -> Self {
        Self {
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            max_width: DEFAULT_MAX_WIDTH,
            max_pixels: DEFAULT_MAX_PIXELS,
        }
    }
}

/// Counters for derivative requests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DerivativeStats {
    /// Derivatives computed and installed
    pub computed: u64,
    /// Requests served from an existing derivative
    pub cached: u64,
}

/// Lazily computed, persisted resizes of stored images.
///
/// A derivative of `path` at `width` is stored as `"<path>-<width>"`. It is
/// computed at most once: the first caller takes the store lock for `path`,
/// writes to a temporary blob and renames it into place, and everyone after
/// reads the installed blob without locking.
pub struct DerivativeCache {
    store: Arc<Store>,
    settings: DerivativeSettings,
    computed: AtomicU64,
    cached: AtomicU64,
}

impl DerivativeCache {
    pub fn new(store: Arc<Store>, settings: DerivativeSettings) -> Self {
        Self {
            store,
            settings,
            computed: AtomicU64::new(0),
            cached: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    fn store(&self) -> &Store {
        &self.store
    }

    pub fn stats(&self) -> DerivativeStats {
        DerivativeStats {
            computed: self.computed.load(Ordering::Relaxed),
            cached: self.cached.load(Ordering::Relaxed),
        }
    }

    /// Open the derivative of `path` at `width`, computing it on first use.
    ///
    /// Returns `None` when the source is empty (no image to derive from).
    #[instrument(skip(self))]
    pub fn get_derivative(&self, path: &str, width: u32) -> Result<Option<File>, DerivativeError> {
        if width == 0 || width > self.settings.max_width {
            return Err(DerivativeError::InvalidWidth {
                width,
                max: self.settings.max_width,
            });
        }

        let name = derivative_name(path, width);
        if let Some(file) = self.open_existing(&name)? {
            self.cached.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("media.derivatives.cached").increment(1);
            return Ok(Some(file));
        }

        let _guard = self.store.lock(path);

        // Another request may have installed it while we waited
        if let Some(file) = self.open_existing(&name)? {
            self.cached.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("media.derivatives.cached").increment(1);
            return Ok(Some(file));
        }

        if !self.compute(path, width, &name)? {
            return Ok(None);
        }

        Ok(Some(self.store.open_blob(&name)?))
    }

    fn open_existing(&self, name: &str) -> Result<Option<File>, DerivativeError> {
        match self.store.open_blob(name) {
            Ok(file) => Ok(Some(file)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Build and install the derivative. Caller holds the lock for `path`.
    fn compute(&self, path: &str, width: u32, name: &str) -> Result<bool, DerivativeError> {
        let started = Instant::now();
        let source = self.store.read(path)?;

        let Some(image) = normalize(&source)? else {
            self.store.remove(name)?;
            debug!(path = %path, "Empty source, no derivative produced");
            return Ok(false);
        };

        let (target_width, target_height) = target_dimensions(image.width(), image.height(), width);
        if u64::from(target_width) * u64::from(target_height) > self.settings.max_pixels {
            return Err(DerivativeError::TooManyPixels {
                width: target_width,
                height: target_height,
                max: self.settings.max_pixels,
            });
        }

        let reduced = reduce(&image, width);
        let encoded =
            encode_jpeg(&reduced, self.settings.jpeg_quality).map_err(DerivativeError::Encode)?;

        let temp = format!("{}{}", TEMP_PREFIX, name);
        let write_err = |source| DerivativeError::Write {
            name: name.to_string(),
            source,
        };
        let mut file = self.store.create(&temp)?;
        file.write_all(&encoded).map_err(write_err)?;
        file.sync_data().map_err(write_err)?;
        drop(file);
        self.store.rename(&temp, name)?;

        self.computed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("media.derivatives.computed").increment(1);
        metrics::histogram!("media.derivative.duration_seconds")
            .record(started.elapsed().as_secs_f64());
        info!(
            derivative = %name,
            width = reduced.width(),
            height = reduced.height(),
            size_bytes = encoded.len(),
            "Derivative installed"
        );

        Ok(true)
    }
}

/// Blob name of the derivative of `path` at `width`.
pub fn derivative_name(path: &str, width: u32) -> String {
    format!("{}-{}", path, width)
}

/// Size of a `width`-wide resize of a `source_width` x `source_height` image.
///
/// The height keeps the aspect ratio, rounded toward zero but never below 1.
pub fn target_dimensions(source_width: u32, source_height: u32, width: u32) -> (u32, u32) {
    if source_width == 0 {
        return (width, 1);
    }
    let height = u64::from(width) * u64::from(source_height) / u64::from(source_width);
    (width, height.clamp(1, u64::from(u32::MAX)) as u32)
}

/// Lanczos3 resize to `width`, preserving aspect ratio.
pub fn reduce(image: &RgbImage, width: u32) -> RgbImage {
    let (w, h) = target_dimensions(image.width(), image.height(), width);
    imageops::resize(image, w, h, FilterType::Lanczos3)
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(image)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::io::Read;

    fn setup() -> (tempfile::TempDir, DerivativeCache) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        (dir, DerivativeCache::new(store, DerivativeSettings::default()))
    }

    fn put_png(store: &Store, name: &str, width: u32, height: u32) {
        let image = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 128]));
        image.save_with_format(store.blob_path(name).unwrap(), image::ImageFormat::Png).unwrap();
    }

    fn read_all(mut file: File) -> Vec<u8> {
        let mut out = Vec::new();
        file.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_derivative_name() {
        assert_eq!(derivative_name("photo.jpg", 100), "photo.jpg-100");
    }

    #[test]
    fn test_target_dimensions() {
        assert_eq!(target_dimensions(400, 300, 100), (100, 75));
        assert_eq!(target_dimensions(300, 400, 100), (100, 133));
        assert_eq!(target_dimensions(1000, 1, 10), (10, 1));
        assert_eq!(target_dimensions(7, 3, 5), (5, 2));
        assert_eq!(target_dimensions(0, 3, 5), (5, 1));
    }

    #[test]
    fn test_reduce_preserves_aspect_ratio() {
        let image = RgbImage::new(640, 480);
        let reduced = reduce(&image, 160);
        assert_eq!(reduced.dimensions(), (160, 120));
    }

    #[test]
    fn test_creates_and_caches_derivative() {
        let (_dir, cache) = setup();
        put_png(cache.store(), "img.png", 64, 32);

        let first = read_all(cache.get_derivative("img.png", 16).unwrap().unwrap());
        assert!(cache.store().exists("img.png-16").unwrap());
        assert_eq!(cache.stats(), DerivativeStats { computed: 1, cached: 0 });

        let decoded = image::load_from_memory(&first).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));

        let second = read_all(cache.get_derivative("img.png", 16).unwrap().unwrap());
        assert_eq!(first, second);
        assert_eq!(cache.stats(), DerivativeStats { computed: 1, cached: 1 });

        // No temporary blob left behind
        assert!(!cache.store().exists(".tmp-img.png-16").unwrap());
    }

    #[test]
    fn test_concurrent_requests_compute_once() {
        let (_dir, cache) = setup();
        put_png(cache.store(), "shared.png", 300, 200);

        let results: Vec<Vec<u8>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| read_all(cache.get_derivative("shared.png", 100).unwrap().unwrap())))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(cache.stats().computed, 1);
        assert_eq!(cache.stats().cached, 7);
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_replacing_source_invalidates_derivative() {
        let (_dir, cache) = setup();
        put_png(cache.store(), "pic.png", 40, 40);
        cache.get_derivative("pic.png", 10).unwrap();

        // An upload of the same name purges derivatives first
        drop(cache.store().replace("pic.png").unwrap());
        assert!(!cache.store().exists("pic.png-10").unwrap());

        put_png(cache.store(), "pic.png", 80, 20);
        let file = cache.get_derivative("pic.png", 10).unwrap().unwrap();
        let decoded = image::load_from_memory(&read_all(file)).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (10, 2));
        assert_eq!(cache.stats().computed, 2);
    }

    #[test]
    fn test_empty_source_yields_no_derivative() {
        let (_dir, cache) = setup();
        drop(cache.store().create("empty").unwrap());

        assert!(cache.get_derivative("empty", 50).unwrap().is_none());
        assert!(!cache.store().exists("empty-50").unwrap());
        assert_eq!(cache.stats().computed, 0);
    }

    #[test]
    fn test_missing_source_is_not_found() {
        let (_dir, cache) = setup();
        assert!(matches!(
            cache.get_derivative("nothing.png", 10),
            Err(DerivativeError::Store(StoreError::NotFound(_)))
        ));
    }

    #[test]
    fn test_undecodable_source() {
        let (_dir, cache) = setup();
        cache.store().create("notes.txt").unwrap().write_all(b"plain text").unwrap();
        assert!(matches!(
            cache.get_derivative("notes.txt", 10),
            Err(DerivativeError::Normalize(NormalizeError::Decode(_)))
        ));
        assert!(!cache.store().exists("notes.txt-10").unwrap());
    }

    fn red_jpeg(width: u32, height: u32) -> Vec<u8> {
        encode_jpeg(&RgbImage::from_pixel(width, height, Rgb([255, 0, 0])), 95).unwrap()
    }

    #[test]
    fn test_partial_upload_never_cached() {
        let (_dir, cache) = setup();
        let jpeg = red_jpeg(128, 128);
        let (head, tail) = jpeg.split_at(jpeg.len() / 2);

        let derived = std::thread::scope(|s| {
            let (mut file, guard) = cache.store().replace("p.jpg").unwrap();
            file.write_all(head).unwrap();

            let reader = s.spawn(|| read_all(cache.get_derivative("p.jpg", 32).unwrap().unwrap()));
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert!(!cache.store().exists("p.jpg-32").unwrap());

            file.write_all(tail).unwrap();
            drop(file);
            drop(guard);
            reader.join().unwrap()
        });

        let decoded = image::load_from_memory(&derived).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (32, 32));
        let bottom = decoded.get_pixel(16, 31);
        assert!(bottom[0] > 200 && bottom[1] < 60, "bottom pixel {:?}", bottom);
        assert_eq!(cache.stats().computed, 1);
    }

    #[test]
    fn test_pixel_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let settings = DerivativeSettings {
            max_pixels: 1000,
            ..Default::default()
        };
        let cache = DerivativeCache::new(store, settings);
        put_png(cache.store(), "tall.png", 1, 400);

        assert!(matches!(
            cache.get_derivative("tall.png", 10),
            Err(DerivativeError::TooManyPixels { width: 10, height: 4000, max: 1000 })
        ));
        assert!(!cache.store().exists("tall.png-10").unwrap());

        // 1x400 fits under the cap
        assert!(cache.get_derivative("tall.png", 1).unwrap().is_some());
    }

    #[test]
    fn test_width_bounds() {
        let (_dir, cache) = setup();
        assert!(matches!(
            cache.get_derivative("x", 0),
            Err(DerivativeError::InvalidWidth { width: 0, .. })
        ));
        assert!(matches!(
            cache.get_derivative("x", DEFAULT_MAX_WIDTH + 1),
            Err(DerivativeError::InvalidWidth { .. })
        ));
    }
}
