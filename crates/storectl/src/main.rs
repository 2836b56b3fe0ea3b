//! Command-line front end for the graphstore engine.
//!
//! Thin plumbing only: flags are parsed, a [`Mall`] is opened at the
//! configured graph root, the subcommand is forwarded, and the result is
//! rendered as text or JSON. Errors go to stderr and the process exits
//! non-zero.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use graphstore::{Change, ChangeKind, Mall, StorageConfig};

#[derive(Debug, Parser)]
#[clap(name = "storectl", version)]
struct App {
    /// Graph root directory
    #[clap(long, default_value = "/var/lib/graphstore")]
    root: PathBuf,

    /// Graph driver
    #[clap(long, default_value = "vfs")]
    driver: String,

    /// Read settings from a TOML file instead of --root/--driver
    #[clap(long, conflicts_with_all = ["root", "driver"])]
    config: Option<PathBuf>,

    /// Prefer JSON output
    #[clap(long, short = 'j')]
    json: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new layer
    CreateLayer {
        /// Explicit id (a random one is generated when omitted)
        #[clap(long)]
        id: Option<String>,
        /// Parent layer name or id
        #[clap(long)]
        parent: Option<String>,
        /// Name for the layer (repeatable)
        #[clap(long = "name")]
        names: Vec<String>,
        /// Create the layer read-write
        #[clap(long)]
        writeable: bool,
    },
    /// Create an image from a top layer
    CreateImage {
        /// Top layer name or id
        top_layer: String,
        #[clap(long)]
        id: Option<String>,
        #[clap(long = "name")]
        names: Vec<String>,
        #[clap(long, default_value = "")]
        metadata: String,
    },
    /// Create a container from an image
    CreateContainer {
        /// Image name or id
        image: String,
        #[clap(long)]
        id: Option<String>,
        #[clap(long = "name")]
        names: Vec<String>,
        #[clap(long, default_value = "")]
        metadata: String,
    },
    /// Delete a layer
    DeleteLayer { layer: String },
    /// Delete an image
    DeleteImage {
        image: String,
        /// Also delete containers built from the image
        #[clap(long)]
        containers: bool,
    },
    /// Delete a container and its read-write layer
    DeleteContainer { container: String },
    /// List layers
    Layers,
    /// List images
    Images,
    /// List containers
    Containers,
    /// Compare two layers
    Changes {
        layer: String,
        reference: Option<String>,
    },
    /// Write the tar diff between two layers to stdout
    Diff {
        layer: String,
        reference: Option<String>,
    },
    /// Print the size of the tar diff between two layers
    Diffsize {
        layer: String,
        reference: Option<String>,
    },
    /// Apply a tar diff read from stdin to a layer
    Applydiff { layer: String },
    /// Mount a layer and print the mount path
    Mount {
        layer: String,
        #[clap(long, default_value = "")]
        label: String,
    },
    /// Unmount a layer
    Unmount { layer: String },
    /// Print the metadata of a layer, image, or container
    Metadata { id: String },
    /// Replace the names of a layer, image, or container
    SetNames {
        id: String,
        #[clap(long = "name", required = true)]
        names: Vec<String>,
    },
    /// Check whether a layer, image, or container exists
    Exists { id: String },
    /// Print the driver's status
    Status,
    /// Delete all containers, images and layers
    Wipe,
}

fn print_changes(changes: &[Change], json: bool) -> Result<()> {
    if json {
        serde_json::to_writer(io::stdout(), changes)?;
        println!();
        return Ok(());
    }
    for change in changes {
        let what = match change.kind {
            ChangeKind::Add => "Add",
            ChangeKind::Modify => "Modify",
            ChangeKind::Delete => "Delete",
        };
        println!("{what} {:?}", change.path);
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let app = App::parse();

    let config = match &app.config {
        Some(path) => StorageConfig::from_toml(&fs::read_to_string(path)?)?,
        None => {
            let mut config = StorageConfig::new(&app.root);
            config.driver = app.driver.clone();
            config
        }
    };
    let mall = Mall::open(&config)?;

    match app.cmd {
        Command::CreateLayer {
            id,
            parent,
            names,
            writeable,
        } => {
            let layer =
                mall.create_layer(id.as_deref(), parent.as_deref(), &names, "", writeable)?;
            if app.json {
                serde_json::to_writer(io::stdout(), &layer)?;
                println!();
            } else {
                println!("{}", layer.id);
            }
        }
        Command::CreateImage {
            top_layer,
            id,
            names,
            metadata,
        } => {
            let image = mall.create_image(id.as_deref(), &names, &top_layer, &metadata)?;
            if app.json {
                serde_json::to_writer(io::stdout(), &image)?;
                println!();
            } else {
                println!("{}", image.id);
            }
        }
        Command::CreateContainer {
            image,
            id,
            names,
            metadata,
        } => {
            let container = mall.create_container(id.as_deref(), &names, &image, &metadata)?;
            if app.json {
                serde_json::to_writer(io::stdout(), &container)?;
                println!();
            } else {
                println!("{}", container.id);
            }
        }
        Command::DeleteLayer { layer } => mall.delete_layer(&layer)?,
        Command::DeleteImage { image, containers } => mall.delete_image(&image, containers)?,
        Command::DeleteContainer { container } => mall.delete_container(&container)?,
        Command::Layers => {
            let layers = mall.layers()?;
            if app.json {
                serde_json::to_writer(io::stdout(), &layers)?;
                println!();
            } else {
                for layer in layers {
                    println!("{} {}", layer.id, layer.names.join(","));
                }
            }
        }
        Command::Images => {
            let images = mall.images()?;
            if app.json {
                serde_json::to_writer(io::stdout(), &images)?;
                println!();
            } else {
                for image in images {
                    println!("{} {}", image.id, image.names.join(","));
                }
            }
        }
        Command::Containers => {
            let containers = mall.containers()?;
            if app.json {
                serde_json::to_writer(io::stdout(), &containers)?;
                println!();
            } else {
                for container in containers {
                    println!("{} {}", container.id, container.names.join(","));
                }
            }
        }
        Command::Changes { layer, reference } => {
            let changes = mall.changes(&layer, reference.as_deref().unwrap_or(""))?;
            print_changes(&changes, app.json)?;
        }
        Command::Diff { layer, reference } => {
            let mut stream = mall.diff(&layer, reference.as_deref().unwrap_or(""))?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            io::copy(&mut stream, &mut out)?;
            out.flush()?;
        }
        Command::Diffsize { layer, reference } => {
            println!(
                "{}",
                mall.diff_size(&layer, reference.as_deref().unwrap_or(""))?
            );
        }
        Command::Applydiff { layer } => {
            let stdin = io::stdin();
            let size = mall.apply_diff(&layer, &mut stdin.lock())?;
            println!("{size}");
        }
        Command::Mount { layer, label } => {
            println!("{}", mall.mount(&layer, &label)?.display());
        }
        Command::Unmount { layer } => mall.unmount(&layer)?,
        Command::Metadata { id } => {
            // Try each entity kind in turn; ids are unique per store only.
            let metadata = if let Ok(layer) = mall.layer(&id) {
                layer.metadata
            } else if let Ok(image) = mall.image(&id) {
                image.metadata
            } else {
                mall.container(&id)?.metadata
            };
            println!("{metadata}");
        }
        Command::SetNames { id, names } => {
            if mall.layer_exists(&id)? {
                mall.set_layer_names(&id, &names)?;
            } else if mall.image_exists(&id)? {
                mall.set_image_names(&id, &names)?;
            } else {
                mall.set_container_names(&id, &names)?;
            }
        }
        Command::Exists { id } => {
            let found =
                mall.layer_exists(&id)? || mall.image_exists(&id)? || mall.container_exists(&id)?;
            if !found {
                anyhow::bail!("{id}: not known");
            }
            println!("{id}");
        }
        Command::Status => {
            let status = mall.status()?;
            if app.json {
                serde_json::to_writer(io::stdout(), &status)?;
                println!();
            } else {
                for (key, value) in status {
                    println!("{key}: {value}");
                }
            }
        }
        Command::Wipe => mall.wipe()?,
    }
    Ok(())
}
