// src/display/terminal.rs
//! Full-screen terminal displays for tracking and fleet sessions

use super::{format_age, format_coordinate, format_value, FleetCommand};
use crate::{
    error::Result,
    fleet::FleetView,
    map::{MapBackend, TrackedEntity},
    sampler::{StatusLevel, StatusMessage, TrackingStatus},
    sync::read,
};
use crossterm::{
    cursor::{Hide, MoveTo, MoveToNextLine, Show},
    event::{self, Event, KeyEventKind},
    execute, queue,
    style::{Color, Print, ResetColor, SetForegroundColor},
    terminal::{self, Clear, ClearType, DisableLineWrap, EnableLineWrap},
};
use std::{
    io::{self, Stdout, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};
use tokio::time::sleep;

const REFRESH: Duration = Duration::from_millis(500);

/// Raw mode with a hidden cursor, restored on drop
struct RawScreen {
    stdout: Stdout,
}

impl RawScreen {
    fn enter() -> Result<Self> {
        let mut stdout = io::stdout();
        terminal::enable_raw_mode()?;
        execute!(stdout, Hide, DisableLineWrap)?;
        Ok(Self { stdout })
    }

    /// Keys pressed since the last frame
    fn pending_commands(&self) -> Result<Vec<FleetCommand>> {
        let mut commands = Vec::new();
        while event::poll(Duration::ZERO)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    commands.extend(FleetCommand::from_key(&key));
                }
            }
        }
        Ok(commands)
    }
}

impl Drop for RawScreen {
    fn drop(&mut self) {
        let _ = execute!(self.stdout, Show, EnableLineWrap, ResetColor);
        let _ = terminal::disable_raw_mode();
    }
}

fn line(stdout: &mut impl Write, text: impl std::fmt::Display) -> Result<()> {
    queue!(stdout, Print(text), MoveToNextLine(1))?;
    Ok(())
}

fn heading(stdout: &mut impl Write, color: Color, text: &str) -> Result<()> {
    queue!(stdout, SetForegroundColor(color), Print(text), ResetColor, MoveToNextLine(1))?;
    Ok(())
}

fn banner(stdout: &mut impl Write, title: &str) -> Result<()> {
    queue!(stdout, SetForegroundColor(Color::Green))?;
    line(stdout, "=".repeat(60))?;
    line(stdout, title)?;
    line(stdout, "=".repeat(60))?;
    queue!(stdout, ResetColor)?;
    Ok(())
}

fn status_line(stdout: &mut impl Write, message: Option<&StatusMessage>) -> Result<()> {
    let Some(message) = message else {
        return line(stdout, "");
    };
    let color = match message.level {
        StatusLevel::Info => Color::White,
        StatusLevel::Warning => Color::Yellow,
        StatusLevel::Error => Color::Red,
    };
    queue!(
        stdout,
        SetForegroundColor(color),
        Print(format!("{}  ({})", message.text, message.at.format("%H:%M:%S"))),
        ResetColor,
        MoveToNextLine(1)
    )?;
    Ok(())
}

/// Status board of the device-side tracking session
pub struct TrackingScreen;

impl TrackingScreen {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self, status: Arc<RwLock<TrackingStatus>>, running: Arc<AtomicBool>) -> Result<()> {
        let mut screen = RawScreen::enter()?;

        while running.load(Ordering::Relaxed) {
            if screen
                .pending_commands()?
                .iter()
                .any(|command| *command == FleetCommand::Quit)
            {
                running.store(false, Ordering::Relaxed);
                break;
            }

            let snapshot = read(&status).clone();
            queue!(screen.stdout, Clear(ClearType::All), MoveTo(0, 0))?;
            self.render(&mut screen.stdout, &snapshot)?;
            screen.stdout.flush()?;

            sleep(REFRESH).await;
        }

        Ok(())
    }

    fn render(&self, stdout: &mut impl Write, status: &TrackingStatus) -> Result<()> {
        banner(stdout, "Fleet Tracker - Location Sharing")?;

        line(stdout, format!("Vehicle:   {}", status.entity_id.as_deref().unwrap_or("-")))?;
        line(stdout, format!("Source:    {}", status.source.as_deref().unwrap_or("-")))?;
        let state = if status.active { "Tracking" } else { "Stopped" };
        line(stdout, format!("State:     {} ({})", state, status.format_duration()))?;
        line(stdout, "")?;

        heading(stdout, Color::Yellow, "LAST SENT POSITION:")?;
        match &status.last_sent {
            Some(fix) => {
                line(stdout, format!("  Latitude:  {}", format_coordinate(Some(fix.coords.latitude))))?;
                line(stdout, format!("  Longitude: {}", format_coordinate(Some(fix.coords.longitude))))?;
                line(stdout, format!("  Accuracy:  {}", format_value(Some(fix.coords.accuracy), "m")))?;
                line(stdout, format!("  Speed:     {}", format_value(fix.coords.speed_kmh(), "km/h")))?;
                line(stdout, format!("  Heading:   {}", format_value(fix.coords.heading, "°")))?;
                line(stdout, format!("  Captured:  {}", format_age(fix.timestamp)))?;
            }
            None => line(stdout, "  Nothing sent yet")?,
        }
        line(stdout, "")?;

        heading(stdout, Color::Cyan, "COUNTERS:")?;
        line(stdout, format!("  Updates sent:       {:>8}", status.updates_sent))?;
        line(stdout, format!("  Fixes received:     {:>8}", status.samples_seen))?;
        line(stdout, format!("  Below thresholds:   {:>8}", status.samples_dropped))?;
        line(stdout, format!("  Invalid:            {:>8}", status.samples_rejected))?;
        line(stdout, format!("  Send failures:      {:>8}", status.transport_failures))?;
        line(stdout, "")?;

        status_line(stdout, status.message.as_ref())?;
        line(stdout, "")?;
        heading(stdout, Color::Green, "Press q to stop sharing")?;
        Ok(())
    }
}

impl Default for TrackingScreen {
    fn default() -> Self {
        Self::new()
    }
}

/// Vehicle table and map state of a fleet session
pub struct FleetScreen;

impl FleetScreen {
    pub fn new() -> Self {
        Self
    }

    pub async fn run<B: MapBackend>(&self, view: &FleetView<B>, running: Arc<AtomicBool>) -> Result<()> {
        let mut screen = RawScreen::enter()?;
        let map = view.map();

        while running.load(Ordering::Relaxed) {
            let entities = map.entities();
            for command in screen.pending_commands()? {
                match command {
                    FleetCommand::Quit => running.store(false, Ordering::Relaxed),
                    FleetCommand::FitAll => {
                        map.fit_all();
                    }
                    FleetCommand::Focus(index) => {
                        if let Some(entity) = entities.get(index) {
                            map.focus_entity(&entity.id);
                        }
                    }
                    FleetCommand::ToggleAutoCenter => {
                        let enabled = !map.options().auto_center;
                        map.set_auto_center(enabled);
                    }
                }
            }
            if !running.load(Ordering::Relaxed) {
                break;
            }

            queue!(screen.stdout, Clear(ClearType::All), MoveTo(0, 0))?;
            self.render(&mut screen.stdout, view, &entities)?;
            screen.stdout.flush()?;

            sleep(REFRESH).await;
        }

        Ok(())
    }

    fn render<B: MapBackend>(&self, stdout: &mut impl Write, view: &FleetView<B>, entities: &[TrackedEntity]) -> Result<()> {
        let map = view.map();
        let status = view.status();
        banner(stdout, "Fleet Tracker - Live Map")?;

        let options = map.options();
        line(
            stdout,
            format!(
                "Map: {:?}   markers: {}   trails: {}   auto-center: {}",
                map.state(),
                map.marker_count(),
                map.polyline_count(),
                if options.auto_center { "on" } else { "off" }
            ),
        )?;
        match map.view() {
            Some(view) => line(
                stdout,
                format!("Center: {:.6}, {:.6}   zoom: {}", view.center.lat, view.center.lng, view.zoom),
            )?,
            None => line(stdout, "Center: -")?,
        }
        line(stdout, format!("Streams connected: {}/{}", status.connected_count(), status.feeds.len()))?;
        line(stdout, "")?;

        heading(stdout, Color::Yellow, "VEHICLES:")?;
        if entities.is_empty() {
            line(stdout, "  Waiting for the first position...")?;
        }
        for (i, entity) in entities.iter().enumerate() {
            let (color, state) = if entity.live {
                (Color::Green, "LIVE")
            } else {
                (Color::DarkGrey, "last known")
            };
            queue!(stdout, SetForegroundColor(color))?;
            line(
                stdout,
                format!(
                    "  {}. {:<20} {} {}  {:>10}  {:>6}  {:>3} pts  {:<10}  {}",
                    i + 1,
                    entity.name,
                    format_coordinate(Some(entity.last.latitude)),
                    format_coordinate(Some(entity.last.longitude)),
                    format_value(entity.last.speed_kmh(), "km/h"),
                    format_value(entity.last.heading, "°"),
                    entity.trail.len(),
                    state,
                    format_age(entity.last_update)
                ),
            )?;
            queue!(stdout, ResetColor)?;
        }
        line(stdout, "")?;

        status_line(stdout, status.message.as_ref())?;
        line(stdout, "")?;
        heading(stdout, Color::Green, "f fit all   1-9 focus   a auto-center   q quit")?;
        Ok(())
    }
}

impl Default for FleetScreen {
    fn default() -> Self {
        Self::new()
    }
}
