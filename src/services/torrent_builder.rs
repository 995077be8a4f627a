//! Torrent metainfo generation
//!
//! Builds one `.torrent` per tracker. Each carries the tracker's source
//! flag so otherwise-identical releases hash to distinct infohashes and
//! can be cross-seeded, and `private=1` as private trackers require.
//! The piece size strategy is per tracker (from the schema): some
//! trackers publish a fixed size table, others are happy with whatever
//! keeps the piece count sane. Piece hashing runs on the blocking pool;
//! a multi-gigabyte file takes a while to digest.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use tracing::{debug, info};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// How a tracker wants piece sizes chosen. All strategies stay within
/// powers of two from 256 KiB to 16 MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PieceSizeStrategy {
    /// Aim for a piece count around a thousand
    #[default]
    Auto,
    /// Conservative size table, ramping from 512 KiB
    Standard,
    /// Fewer, larger pieces; some trackers mandate this shape
    Coarse,
}

/// Conservative table: threshold in bytes -> piece size.
const STANDARD_PIECE_SIZES: &[(u64, u64)] = &[
    (512 * MIB, 512 * KIB),
    (GIB, MIB),
    (2 * GIB, 2 * MIB),
    (4 * GIB, 4 * MIB),
    (8 * GIB, 8 * MIB),
];

/// Coarse table: jumps to large pieces early.
const COARSE_PIECE_SIZES: &[(u64, u64)] = &[
    (GIB, MIB),
    (2 * GIB, 2 * MIB),
    (3 * GIB, 4 * MIB),
    (8 * GIB, 8 * MIB),
];

fn table_lookup(table: &[(u64, u64)], file_size: u64) -> u64 {
    for &(threshold, piece_size) in table {
        if file_size < threshold {
            return piece_size;
        }
    }
    16 * MIB
}

/// Pick the piece size for a file of the given length under a strategy.
pub fn piece_size_for(file_size: u64, strategy: PieceSizeStrategy) -> u64 {
    match strategy {
        PieceSizeStrategy::Auto => {
            let target = (file_size / 1200).max(1).next_power_of_two();
            target.clamp(256 * KIB, 16 * MIB)
        }
        PieceSizeStrategy::Standard => table_lookup(STANDARD_PIECE_SIZES, file_size),
        PieceSizeStrategy::Coarse => table_lookup(COARSE_PIECE_SIZES, file_size),
    }
}

// Bencode dictionaries must have sorted keys; serde_bencode emits struct
// fields in declaration order, so the declarations below are sorted.

#[derive(Serialize)]
struct MetaInfo<'a> {
    announce: &'a str,
    comment: &'a str,
    #[serde(rename = "created by")]
    created_by: &'a str,
    #[serde(rename = "creation date")]
    creation_date: i64,
    info: InfoDict,
}

#[derive(Serialize)]
struct InfoDict {
    length: i64,
    name: String,
    #[serde(rename = "piece length")]
    piece_length: i64,
    pieces: ByteBuf,
    private: i64,
    source: String,
}

/// A generated torrent with its on-disk path and infohash.
#[derive(Debug, Clone)]
pub struct BuiltTorrent {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub infohash: String,
    pub piece_size: u64,
}

pub struct TorrentBuilder {
    output_dir: PathBuf,
}

impl TorrentBuilder {
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }

    /// Generate a `.torrent` for one tracker.
    ///
    /// The output filename is `{release_name}_{TrackerName}.torrent`.
    /// Re-running on the same inputs overwrites the file with identical
    /// bytes apart from the creation date, which is acceptable for
    /// stage idempotence because the infohash only covers the info dict.
    #[allow(clippy::too_many_arguments)]
    pub async fn build(
        &self,
        media_path: &Path,
        announce_url: &str,
        source_flag: &str,
        release_name: &str,
        tracker_name: &str,
        strategy: PieceSizeStrategy,
    ) -> Result<BuiltTorrent> {
        let media_path = media_path.to_path_buf();
        let file_size = tokio::fs::metadata(&media_path)
            .await
            .with_context(|| format!("media file missing: {}", media_path.display()))?
            .len();

        if source_flag.trim().is_empty() {
            bail!("tracker source flag must be non-empty");
        }

        let piece_size = piece_size_for(file_size, strategy);
        let torrent_name = media_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| release_name.to_string());

        debug!(
            file = %media_path.display(),
            size = file_size,
            piece_size = piece_size,
            strategy = ?strategy,
            source = source_flag,
            "Hashing file for torrent"
        );

        let announce = announce_url.to_string();
        let source = source_flag.trim().to_string();
        let creation_date = chrono::Utc::now().timestamp();

        // Hashing is CPU and disk bound; keep it off the async runtime
        let (bytes, infohash) = tokio::task::spawn_blocking(move || {
            let pieces = hash_pieces(&media_path, piece_size)?;
            let info = InfoDict {
                length: file_size as i64,
                name: torrent_name,
                piece_length: piece_size as i64,
                pieces: ByteBuf::from(pieces),
                private: 1,
                source,
            };

            let info_bytes =
                serde_bencode::to_bytes(&info).context("failed to encode info dict")?;
            let infohash = format!("{:x}", Sha1::digest(&info_bytes));

            let meta = MetaInfo {
                announce: &announce,
                comment: "Published with seedforge",
                created_by: "seedforge",
                creation_date,
                info,
            };
            let bytes = serde_bencode::to_bytes(&meta).context("failed to encode metainfo")?;
            Ok::<_, anyhow::Error>((bytes, infohash))
        })
        .await
        .context("torrent hashing task panicked")??;

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let tracker_suffix = tracker_name.replace(' ', "");
        let torrent_path = self
            .output_dir
            .join(format!("{release_name}_{tracker_suffix}.torrent"));
        tokio::fs::write(&torrent_path, &bytes)
            .await
            .with_context(|| format!("failed to write {}", torrent_path.display()))?;

        info!(
            path = %torrent_path.display(),
            infohash = %infohash,
            "Torrent generated"
        );

        Ok(BuiltTorrent {
            path: torrent_path,
            bytes,
            infohash,
            piece_size,
        })
    }
}

/// SHA-1 each fixed-size piece of the file, concatenated.
fn hash_pieces(path: &Path, piece_size: u64) -> Result<Vec<u8>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = std::io::BufReader::with_capacity(piece_size as usize, file);
    let mut buffer = vec![0u8; piece_size as usize];
    let mut pieces = Vec::new();

    loop {
        let mut filled = 0usize;
        while filled < buffer.len() {
            let n = reader.read(&mut buffer[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        let digest = Sha1::digest(&buffer[..filled]);
        pieces.extend_from_slice(&digest);
        if filled < buffer.len() {
            break;
        }
    }

    Ok(pieces)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_size_tables_are_powers_of_two() {
        for table in [STANDARD_PIECE_SIZES, COARSE_PIECE_SIZES] {
            for &(_, piece) in table {
                assert!(piece.is_power_of_two());
                assert!((256 * KIB..=16 * MIB).contains(&piece));
            }
        }
    }

    #[test]
    fn test_standard_strategy_selection() {
        let s = PieceSizeStrategy::Standard;
        assert_eq!(piece_size_for(100 * MIB, s), 512 * KIB);
        assert_eq!(piece_size_for(700 * MIB, s), MIB);
        assert_eq!(piece_size_for(3 * GIB, s), 4 * MIB);
        assert_eq!(piece_size_for(20 * GIB, s), 16 * MIB);
    }

    #[test]
    fn test_coarse_strategy_jumps_to_large_pieces() {
        let c = PieceSizeStrategy::Coarse;
        assert_eq!(piece_size_for(700 * MIB, c), MIB);
        assert_eq!(piece_size_for(1500 * MIB, c), 2 * MIB);
        assert_eq!(piece_size_for(2500 * MIB, c), 4 * MIB);
        assert_eq!(piece_size_for(5 * GIB, c), 8 * MIB);
        assert_eq!(piece_size_for(20 * GIB, c), 16 * MIB);

        // Coarse picks at least as large a piece as standard everywhere
        for size in [300 * MIB, 900 * MIB, 2500 * MIB, 5 * GIB, 12 * GIB] {
            assert!(piece_size_for(size, c) >= piece_size_for(size, PieceSizeStrategy::Standard));
        }
    }

    #[test]
    fn test_auto_strategy_targets_sane_piece_count() {
        let a = PieceSizeStrategy::Auto;
        assert_eq!(piece_size_for(100 * MIB, a), 256 * KIB);
        assert_eq!(piece_size_for(20 * GIB, a), 16 * MIB);
        for size in [64 * MIB, 900 * MIB, 5 * GIB, 40 * GIB] {
            let piece = piece_size_for(size, a);
            assert!(piece.is_power_of_two());
            assert!((256 * KIB..=16 * MIB).contains(&piece));
            let count = size.div_ceil(piece);
            assert!(count >= 1);
            assert!(count <= 4096, "size {size} gives {count} pieces");
        }
    }

    #[test]
    fn test_piece_count_stays_sane_under_every_strategy() {
        for strategy in [
            PieceSizeStrategy::Auto,
            PieceSizeStrategy::Standard,
            PieceSizeStrategy::Coarse,
        ] {
            for size in [64 * MIB, 900 * MIB, 5 * GIB, 40 * GIB] {
                let piece = piece_size_for(size, strategy);
                let count = size.div_ceil(piece);
                assert!(count >= 1);
                assert!(count <= 8192, "size {size} gives {count} pieces");
            }
        }
    }

    #[tokio::test]
    async fn test_built_torrent_is_private_with_source() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("Release.2021.1080p.mkv");
        tokio::fs::write(&media, vec![0u8; 100_000]).await.unwrap();

        let builder = TorrentBuilder::new(dir.path().to_path_buf());
        let built = builder
            .build(
                &media,
                "https://demo.example/announce?passkey=abc",
                "demo",
                "Release.2021.1080p",
                "Demo Tracker",
                PieceSizeStrategy::Standard,
            )
            .await
            .unwrap();

        let text = String::from_utf8_lossy(&built.bytes).to_string();
        assert!(text.contains("7:privatei1e"));
        assert!(text.contains("6:source4:demo"));
        assert!(text.contains("8:announce"));
        assert_eq!(built.infohash.len(), 40);
        assert!(built.path.ends_with("Release.2021.1080p_DemoTracker.torrent"));

        // Same inputs hash to the same infohash
        let again = builder
            .build(
                &media,
                "https://demo.example/announce?passkey=abc",
                "demo",
                "Release.2021.1080p",
                "Demo Tracker",
                PieceSizeStrategy::Standard,
            )
            .await
            .unwrap();
        assert_eq!(built.infohash, again.infohash);
    }

    #[tokio::test]
    async fn test_distinct_source_flags_give_distinct_infohashes() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("movie.mkv");
        tokio::fs::write(&media, vec![7u8; 50_000]).await.unwrap();

        let builder = TorrentBuilder::new(dir.path().to_path_buf());
        let a = builder
            .build(
                &media,
                "https://a/announce",
                "alpha",
                "movie",
                "A",
                PieceSizeStrategy::Auto,
            )
            .await
            .unwrap();
        let b = builder
            .build(
                &media,
                "https://b/announce",
                "beta",
                "movie",
                "B",
                PieceSizeStrategy::Auto,
            )
            .await
            .unwrap();
        assert_ne!(a.infohash, b.infohash);
    }

    #[tokio::test]
    async fn test_empty_source_flag_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("movie.mkv");
        tokio::fs::write(&media, b"data").await.unwrap();

        let builder = TorrentBuilder::new(dir.path().to_path_buf());
        let result = builder
            .build(
                &media,
                "https://a/announce",
                "  ",
                "movie",
                "A",
                PieceSizeStrategy::Auto,
            )
            .await;
        assert!(result.is_err());
    }
}
