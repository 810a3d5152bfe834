//! Writing shard records back out as loose image files.

use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::dataset::Dataset;
use crate::error::ExtractError;
use crate::shard::{ShardCodec, TileRecord};
use crate::source::path_to_name;

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G'];

fn image_extension(image: &[u8]) -> &'static str {
    if image.starts_with(PNG_MAGIC) {
        "png"
    } else {
        "jpg"
    }
}

fn tile_file_name(slide: &str, index: usize, record: &TileRecord) -> String {
    let ext = image_extension(&record.image);
    match record.location {
        Some((x, y)) => format!("{slide}-{x}-{y}.{ext}"),
        None => format!("{slide}-{index}.{ext}"),
    }
}

/// Write every record of every active shard to `dest/<slide>/`.
///
/// Returns the number of tiles written.
pub fn export_tiles(
    dataset: &Dataset,
    codec: &dyn ShardCodec,
    dest: &Path,
) -> Result<usize, ExtractError> {
    let _enter = dataset.span().enter();
    let shards = dataset.shards()?;
    info!("Exporting tiles from {} shards to {}", shards.len(), dest.display());

    let mut written = 0;
    for shard in shards {
        let slide = path_to_name(&shard);
        let dir = dest.join(&slide);
        fs::create_dir_all(&dir).map_err(|e| ExtractError::io(&dir, e))?;

        let records = codec.read_records(&shard)?;
        for (index, record) in records.iter().enumerate() {
            let path = dir.join(tile_file_name(&slide, index, record));
            fs::write(&path, &record.image).map_err(|e| ExtractError::io(&path, e))?;
        }
        debug!("Exported {} tiles from {}", records.len(), slide);
        written += records.len();
    }
    Ok(written)
}
