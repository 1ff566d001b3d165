//! Shared fixtures for the integration tests

use std::path::Path;

use libshot::{
    CapturedImage,
    capture::selector::{PRIMARY_BUTTON, SelectionEvent},
    model::{SessionEnvironment, SessionType},
};

pub fn env(session: &str, desktop: &str, display: bool) -> SessionEnvironment {
    SessionEnvironment::new(SessionType::parse(session), desktop, display)
}

/// Writes a PNG of the given size and returns its `file://` URI
pub fn png_uri(dir: &Path, name: &str, width: u32, height: u32) -> String {
    let path = dir.join(name);
    CapturedImage::from_test_pattern(width, height).save(&path).unwrap();
    url::Url::from_file_path(&path).unwrap().to_string()
}

pub fn drag(from: (i32, i32), to: (i32, i32)) -> Vec<SelectionEvent> {
    vec![
        SelectionEvent::PointerDown {
            x:      from.0,
            y:      from.1,
            button: PRIMARY_BUTTON,
        },
        SelectionEvent::PointerMotion { x: to.0, y: to.1 },
        SelectionEvent::PointerUp {
            x:      to.0,
            y:      to.1,
            button: PRIMARY_BUTTON,
        },
    ]
}
