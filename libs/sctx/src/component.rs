use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ServiceContext;
use crate::flags::FlagSet;

/// A named plugin driven through the service context lifecycle.
///
/// Registration order is the dependency order: during [`Component::activate`]
/// a component may look up any component registered before it, never one
/// registered after it.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    /// Registry key; must be non-empty and stable.
    fn id(&self) -> &str;

    /// Declare every option into the shared namespace. Called once by the
    /// builder, before parsing. Must not touch external resources.
    fn register_config(&mut self, _flags: &mut FlagSet) {}

    /// Acquire external resources using the parsed configuration.
    ///
    /// On error nothing acquired here may stay reachable.
    async fn activate(&self, ctx: &ServiceContext) -> anyhow::Result<()>;

    /// Release what `activate` acquired. Idempotent, and a no-op when the
    /// component never activated.
    async fn shutdown(&self) -> anyhow::Result<()>;
}

pub(crate) type View = Box<dyn Any + Send + Sync>;

type Cast<C> = Box<dyn FnOnce(&Arc<C>) -> (TypeId, View) + Send>;

/// A component plus the capability views it is reachable under.
///
/// The concrete type and `dyn Component` are always available to lookups;
/// [`Registration::provides`] adds trait-object views:
///
/// ```rust,ignore
/// ServiceContext::builder()
///     .with_component(Registration::new(RedisComponent::new("cache")).provides::<dyn KeyValue>(|c| c))
/// ```
pub struct Registration<C: Component> {
    component: C,
    casts: Vec<Cast<C>>,
}

impl<C: Component> Registration<C> {
    pub fn new(component: C) -> Self {
        Self {
            component,
            casts: Vec::new(),
        }
    }

    /// Make the component reachable as `Arc<U>`, usually a trait object.
    pub fn provides<U>(mut self, cast: impl FnOnce(Arc<C>) -> Arc<U> + Send + 'static) -> Self
    where
        U: ?Sized + Send + Sync + 'static,
    {
        self.casts.push(Box::new(move |component: &Arc<C>| {
            let view: Arc<U> = cast(Arc::clone(component));
            (TypeId::of::<Arc<U>>(), Box::new(view) as View)
        }));
        self
    }

    pub(crate) fn id(&self) -> &str {
        self.component.id()
    }

    /// Run `register_config`, then freeze the component behind an `Arc`.
    pub(crate) fn register(mut self, flags: &mut FlagSet) -> ComponentEntry {
        self.component.register_config(flags);

        let id = self.component.id().to_string();
        let concrete = Arc::new(self.component);
        let component: Arc<dyn Component> = concrete.clone();

        let mut views: HashMap<TypeId, View> = HashMap::new();
        views.insert(TypeId::of::<Arc<C>>(), Box::new(concrete.clone()));
        views.insert(TypeId::of::<Arc<dyn Component>>(), Box::new(component.clone()));
        for cast in self.casts {
            let (type_id, view) = cast(&concrete);
            views.insert(type_id, view);
        }

        ComponentEntry {
            id,
            type_name: type_name::<C>(),
            component,
            views,
        }
    }
}

/// Anything `ServiceContextBuilder::with_component` accepts.
pub trait IntoRegistration {
    type Component: Component;
    fn into_registration(self) -> Registration<Self::Component>;
}

impl<C: Component> IntoRegistration for C {
    type Component = C;
    fn into_registration(self) -> Registration<C> {
        Registration::new(self)
    }
}

impl<C: Component> IntoRegistration for Registration<C> {
    type Component = C;
    fn into_registration(self) -> Registration<C> {
        self
    }
}

/// A registered component with its type-erased views.
pub(crate) struct ComponentEntry {
    pub(crate) id: String,
    pub(crate) type_name: &'static str,
    pub(crate) component: Arc<dyn Component>,
    views: HashMap<TypeId, View>,
}

impl ComponentEntry {
    pub(crate) fn view<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.views
            .get(&TypeId::of::<Arc<T>>())
            .and_then(|view| view.downcast_ref::<Arc<T>>())
            .cloned()
    }
}

impl std::fmt::Debug for ComponentEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentEntry")
            .field("id", &self.id)
            .field("type", &self.type_name)
            .field("views", &self.views.len())
            .finish()
    }
}
