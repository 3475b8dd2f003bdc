use std::{
    io,
    path::{Path, PathBuf},
    thread,
    time::Instant,
};

use clap::Parser;
use color_eyre as ey;
use ey::eyre::{eyre, Context};
use kiln_content::{runtime::NullRuntime, AssetManager, Event, ProjectConfig, ProjectSettings, TICK_INTERVAL};
use kiln_shared::log::{self, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
enum CommandLineArguments {
    /// Creates a new project
    Init(Init),
    /// Imports all outdated assets of a project
    Import(Import),
    /// Imports the project and keeps importing changed files
    Watch(ProjectArgument),
    /// Deletes the artifacts that don't belong to any asset
    Cleanup(ProjectArgument),
    /// Prints the assets of the manifest
    List(ProjectArgument),
}

#[derive(Parser, Debug)]
struct Init {
    /// Directory in which the project is created
    directory: PathBuf,

    /// Name of the project
    #[arg(short, long)]
    name: String,

    /// Company that is written into the manifest
    #[arg(short, long, default_value = "")]
    company: String,
}

#[derive(Parser, Debug)]
struct Import {
    /// Project file
    project: PathBuf,

    /// Imports every asset again
    #[arg(short, long)]
    force: bool,
}

#[derive(Parser, Debug)]
struct ProjectArgument {
    /// Project file
    project: PathBuf,
}

fn main() -> ey::Result<()> {
    // Setup logging
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                kiln_shared::chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(io::stdout())
        .apply()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    let command_line_arguments = CommandLineArguments::parse();
    match &command_line_arguments {
        CommandLineArguments::Init(init) => {
            let mut config = ProjectConfig::new(&init.name);
            config.company = init.company.clone();
            let project_file = init.directory.join(format!("{}.kiln", init.name));
            let project = ProjectSettings::with_config(&project_file, config).wrap_err("Failed to create the project")?;
            project.save().wrap_err("Failed to write the project file")?;
            info!("Created project {:?}", project.project_file());
        }
        CommandLineArguments::Import(import) => {
            let mut asset_manager = open(&import.project)?;
            run_import(&mut asset_manager, import.force)?;
        }
        CommandLineArguments::Watch(watch) => {
            let mut asset_manager = open(&watch.project)?;
            asset_manager.set_watching(true);
            run_import(&mut asset_manager, false)?;
            info!("Watching {:?}", asset_manager.project().content_path());
            loop {
                asset_manager.tick();
                thread::sleep(TICK_INTERVAL);
            }
        }
        CommandLineArguments::Cleanup(cleanup) => {
            let mut asset_manager = open(&cleanup.project)?;
            // Registers the existing artifacts so that only the orphans are deleted.
            run_import(&mut asset_manager, false)?;
            asset_manager.cleanup_bundle().wrap_err("Failed to clean up the import cache")?;
        }
        CommandLineArguments::List(list) => {
            let mut asset_manager = open(&list.project)?;
            run_import(&mut asset_manager, false)?;
            for (key, entry) in asset_manager.index().entries() {
                println!("{} {:<12} {}", entry.guid, entry.type_name, key.as_str());
            }
        }
    }
    Ok(())
}

fn open(project_file: &Path) -> ey::Result<AssetManager> {
    let project = ProjectSettings::load(project_file).wrap_err_with(|| format!("Failed to load project {project_file:?}"))?;
    AssetManager::new(project, Box::new(NullRuntime))
        .with_default_converters()
        .wrap_err("Failed to register the converters")
}

/// Scans the project and ticks the manager until the import finished.
fn run_import(asset_manager: &mut AssetManager, force: bool) -> ey::Result<()> {
    let events = asset_manager.observe();
    let start = Instant::now();
    asset_manager.rescan(force);
    loop {
        asset_manager.tick();
        for event in events.try_iter() {
            match event {
                Event::ImportStarted { count, message } => info!("{message}: {count}"),
                Event::Imported { path, type_name } => info!("Imported {path:?} ({type_name})"),
                Event::BuildSuccessful(false) => return Err(eyre!("The build of the project failed")),
                Event::ImportFinished => {
                    info!("Import finished after {:.2}s", start.elapsed().as_secs_f32());
                    return Ok(());
                }
                _ => {}
            }
        }
        if asset_manager.is_busy() {
            thread::sleep(TICK_INTERVAL);
        }
    }
}
