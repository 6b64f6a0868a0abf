use std::path::PathBuf;

use bytes::Bytes;
use clap::Parser;
use geotile::model::element::ElementKind;
use geotile::{read_tile, validate_blob, FeatureType, Tile};

#[derive(Parser, Debug)]
pub struct Args {
    /// Path to the tile blob
    path: PathBuf,

    /// Tile address as z/x/y (e.g. 12/2048/1365)
    #[arg(short, long)]
    tile: String,

    /// The store keeps way-node ids
    #[arg(long)]
    waynode_ids: bool,
}

pub fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let tile = parse_tile(&args.tile).ok_or("tile must be given as z/x/y")?;
    let blob = Bytes::from(std::fs::read(&args.path)?);
    validate_blob(&blob)?;
    println!(
        "{}: {} bytes, checksum OK",
        args.path.display(),
        blob.len()
    );

    let mut model = read_tile(tile, blob)?;
    model.set_waynode_ids(args.waynode_ids);

    let mut nodes = 0usize;
    let mut ways = 0usize;
    let mut relations = 0usize;
    let mut strings = 0usize;
    let mut tag_tables = 0usize;
    let mut rel_tables = 0usize;
    for (id, elem) in model.elements() {
        match elem.kind {
            ElementKind::Node | ElementKind::Feature2D => {
                match model.stub(id).feature_type() {
                    FeatureType::Node => nodes += 1,
                    FeatureType::Way => ways += 1,
                    FeatureType::Relation => relations += 1,
                }
            }
            ElementKind::String => strings += 1,
            ElementKind::TagTable => tag_tables += 1,
            ElementKind::RelTable => rel_tables += 1,
            _ => {}
        }
    }
    println!("tile {tile} ({})", tile.bounds());
    println!("  {nodes} nodes, {ways} ways, {relations} relations");
    println!("  {strings} strings, {tag_tables} tag tables, {rel_tables} relation tables");
    match model.export_table() {
        Some(exports) => {
            let count = (model.element(exports).size / 4 - 1) as usize;
            println!("  {count} exported features");
        }
        None => println!("  no export table"),
    }
    Ok(())
}

fn parse_tile(s: &str) -> Option<Tile> {
    let mut parts = s.split('/');
    let zoom = parts.next()?.parse().ok()?;
    let col = parts.next()?.parse().ok()?;
    let row = parts.next()?.parse().ok()?;
    if parts.next().is_some() || zoom > 16 {
        return None;
    }
    Some(Tile::new(zoom, col, row))
}
