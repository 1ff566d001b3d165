//! Backend selection as seen through the `Capturer` facade
//!
//! Every collaborator is mocked, so these run anywhere.

mod common;

use std::sync::Arc;

use libshot::{
    BackendKind, CaptureError, Capturer, Region,
    capture::{
        mock::{MockFactory, MockPortalBus, MockPrimitive, MockShellBus, MockTool, ToolBehavior},
        shell_backend::AreaReply,
    },
};

use crate::common::{env, png_uri};

#[tokio::test]
async fn test_gnome_wayland_without_shell_sticks_to_portal() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(MockPortalBus::new());
    bus.push_matching_response(0, Some(&png_uri(dir.path(), "first.png", 64, 48)));
    bus.push_matching_response(0, Some(&png_uri(dir.path(), "second.png", 32, 16)));

    let factory = Arc::new(
        MockFactory::new(MockPrimitive::single(1920, 1080))
            .shell_unavailable()
            .with_portal_bus(bus.clone()),
    );
    let capturer = Capturer::with_factory(factory.clone()).with_environment(env("wayland", "GNOME", false));

    let first = capturer.capture(None, 1).await.unwrap().unwrap();
    let second = capturer.capture_interactive().await.unwrap().unwrap();

    assert_eq!(first.dimensions(), (64, 48));
    assert_eq!(second.dimensions(), (32, 16));
    assert_eq!(capturer.backend_kind().await.unwrap(), BackendKind::Portal);
    assert_eq!(factory.shell_attempts(), 1, "the shell is not retried");
    assert_eq!(factory.portal_attempts(), 1);
    assert_eq!(bus.requests().len(), 2);
}

#[tokio::test]
async fn test_gnome_wayland_uses_shell_when_available() {
    let shell = Arc::new(MockShellBus::new(Ok(AreaReply::selected(0, 0, 120, 80))));
    let tool = Arc::new(MockTool::new(ToolBehavior::Exit(1)));
    let factory = Arc::new(MockFactory::new(MockPrimitive::single(1920, 1080)).with_shell(shell.clone(), tool.clone()));
    let capturer = Capturer::with_factory(factory.clone()).with_environment(env("wayland", "ubuntu:GNOME", true));

    let image = capturer.capture_interactive().await.unwrap().unwrap();

    assert_eq!(image.dimensions(), (120, 80));
    assert_eq!(capturer.backend_kind().await.unwrap(), BackendKind::DesktopShell);
    assert_eq!(shell.select_calls(), 1);
    assert_eq!(tool.runs(), 0);
    assert_eq!(factory.portal_attempts(), 0);
}

#[tokio::test]
async fn test_other_wayland_desktops_use_portal() {
    let factory = Arc::new(MockFactory::new(MockPrimitive::single(1920, 1080)));
    let capturer = Capturer::with_factory(factory.clone()).with_environment(env("wayland", "KDE", true));

    assert_eq!(capturer.backend_kind().await.unwrap(), BackendKind::Portal);
    assert_eq!(factory.shell_attempts(), 0);
}

#[tokio::test]
async fn test_display_without_session_type_is_direct_access() {
    let factory = Arc::new(MockFactory::new(MockPrimitive::single(1920, 1080)));
    let capturer = Capturer::with_factory(factory.clone()).with_environment(env("", "", true));

    let image = capturer.capture(Region::new(100, 100, 500, 500), 1).await.unwrap().unwrap();
    assert_eq!(image.dimensions(), (500, 500));
    assert_eq!(capturer.backend_kind().await.unwrap(), BackendKind::DirectAccess);
}

#[tokio::test]
async fn test_unsupported_session_is_retried() {
    let factory = Arc::new(MockFactory::new(MockPrimitive::single(1920, 1080)));
    let capturer = Capturer::with_factory(factory.clone()).with_environment(env("tty", "", false));

    for _ in 0..2 {
        let result = capturer.capture(None, 1).await;
        match result {
            Err(e @ CaptureError::UnsupportedSession { .. }) => assert!(!e.remediation_hint().is_empty()),
            other => panic!("expected UnsupportedSession, got {:?}", other.map(|i| i.is_some())),
        }
    }
    assert_eq!(factory.direct_attempts(), 0);
}

#[tokio::test]
async fn test_both_wayland_buses_down() {
    let factory = Arc::new(
        MockFactory::new(MockPrimitive::single(1920, 1080))
            .shell_unavailable()
            .portal_unavailable(),
    );
    let capturer = Capturer::with_factory(factory).with_environment(env("wayland", "GNOME", true));

    let result = capturer.list_monitors().await;
    assert!(matches!(result, Err(CaptureError::BusUnavailable { .. })));
}
