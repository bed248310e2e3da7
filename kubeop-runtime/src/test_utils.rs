use kubeop_core::{NotUsed, Object, ResourceSpec};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WidgetSpec {
    pub size: u32,
}

impl ResourceSpec for WidgetSpec {
    const GROUP: &'static str = "example.com";
    const KIND: &'static str = "Widget";
    const PLURAL: &'static str = "widgets";
    const VERSION: &'static str = "v1";
}

pub type Widget = Object<WidgetSpec, NotUsed>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GadgetSpec {
    pub color: String,
}

impl ResourceSpec for GadgetSpec {
    const GROUP: &'static str = "example.com";
    const KIND: &'static str = "Gadget";
    const PLURAL: &'static str = "gadgets";
    const RESYNC_INTERVAL: Option<&'static str> = Some("30s");
    const VERSION: &'static str = "v1";
}

pub type Gadget = Object<GadgetSpec, NotUsed>;

pub fn widget(name: &str, namespace: Option<&str>, generation: i64) -> Widget {
    let mut obj = Widget::new(name, WidgetSpec::default()).with_generation(generation);
    obj.metadata.namespace = namespace.map(String::from);
    obj
}

pub fn gadget(name: &str, namespace: &str) -> Gadget {
    Gadget::new(name, GadgetSpec::default()).within(namespace)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
