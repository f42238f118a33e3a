//! Native-backed class binding
//!
//! A [`ClassDefinition`] describes a constructor, accessors, methods and a
//! finalizer. [`compile`] turns it into an engine template; every member is
//! registered in the environment's member table and the template only ever
//! sees the resulting [`CallbackData`](crate::engine::CallbackData).

use crate::callback::{
    CallbackTables, Finalizer, FunctionEntry, MemberEntry, NativeFunction, PropertyGetter,
    PropertySetter,
};
use crate::engine::{Engine, ObjRef, ReclaimInfo, TemplateDesc, TemplateId, INTERNAL_FIELD_COUNT};
use crate::error::ClassError;
use crate::handle::ObjectHandle;
use std::ffi::c_void;
use std::fmt;
use std::rc::Rc;

pub struct ConstructorDefinition {
    pub function: NativeFunction,
    pub flags: u32,
}

pub struct PropertyDefinition {
    pub name: String,
    pub getter: Option<PropertyGetter>,
    pub setter: Option<PropertySetter>,
    pub flags: u32,
}

pub struct MethodDefinition {
    pub name: String,
    pub function: NativeFunction,
    pub flags: u32,
}

/// Declarative class description.
#[derive(Default)]
pub struct ClassDefinition {
    /// `None` makes an anonymous class that is never registered by name.
    pub name: Option<String>,
    pub constructor: Option<ConstructorDefinition>,
    pub finalizer: Option<Finalizer>,
    pub properties: Vec<PropertyDefinition>,
    pub methods: Vec<MethodDefinition>,
}

impl ClassDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        ClassDefinition {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn constructor<F>(mut self, flags: u32, function: F) -> Self
    where
        F: Fn(&crate::Environment, Option<ObjectHandle>, &[crate::TaggedValue]) -> Option<crate::TaggedValue>
            + 'static,
    {
        self.constructor = Some(ConstructorDefinition {
            function: Rc::new(function),
            flags,
        });
        self
    }

    pub fn property(
        mut self,
        name: impl Into<String>,
        getter: Option<PropertyGetter>,
        setter: Option<PropertySetter>,
        flags: u32,
    ) -> Self {
        self.properties.push(PropertyDefinition {
            name: name.into(),
            getter,
            setter,
            flags,
        });
        self
    }

    pub fn method<F>(mut self, name: impl Into<String>, flags: u32, function: F) -> Self
    where
        F: Fn(&crate::Environment, Option<ObjectHandle>, &[crate::TaggedValue]) -> Option<crate::TaggedValue>
            + 'static,
    {
        self.methods.push(MethodDefinition {
            name: name.into(),
            function: Rc::new(function),
            flags,
        });
        self
    }

    pub fn finalizer<F>(mut self, finalizer: F) -> Self
    where
        F: Fn(*mut c_void, *mut c_void) + 'static,
    {
        self.finalizer = Some(Rc::new(finalizer));
        self
    }

    fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }
}

/// A compiled class. Identity is the `Rc` allocation.
pub struct CompiledClass {
    name: Option<String>,
    template: TemplateId,
    constructible: bool,
    finalizer: Option<Finalizer>,
    parent: Option<JsClass>,
}

pub type JsClass = Rc<CompiledClass>;

impl CompiledClass {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn template(&self) -> TemplateId {
        self.template
    }

    pub fn is_constructible(&self) -> bool {
        self.constructible
    }

    pub fn parent(&self) -> Option<&JsClass> {
        self.parent.as_ref()
    }

    /// Creates an instance without running the constructor.
    pub(crate) fn new_instance(&self, engine: &dyn Engine) -> Option<ObjRef> {
        let obj = engine.template_new_instance(self.template)?;
        if let Some(finalizer) = &self.finalizer {
            attach_finalizer(engine, obj, finalizer.clone());
        }
        Some(obj)
    }
}

impl fmt::Debug for CompiledClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledClass")
            .field("name", &self.name)
            .field("template", &self.template)
            .field("constructible", &self.constructible)
            .finish()
    }
}

/// Arranges for `finalizer` to run once `obj` is collected. The weak slot is
/// dropped on the floor; the engine frees it after the callback.
pub(crate) fn attach_finalizer(engine: &dyn Engine, obj: ObjRef, finalizer: Finalizer) -> bool {
    let Some(id) = engine.new_persistent(obj) else {
        return false;
    };
    engine.set_weak(
        id,
        Some(Box::new(move |reclaim: ReclaimInfo| {
            finalizer(reclaim.internal_fields[0], reclaim.internal_fields[1])
        })),
    )
}

fn validate(definition: &ClassDefinition, parent: Option<&JsClass>) -> Result<(), ClassError> {
    let name = definition.display_name();
    if let Some(parent) = parent {
        if definition.constructor.is_none() {
            return Err(ClassError::ParentWithoutConstructor(name.to_string()));
        }
        if !parent.constructible {
            return Err(ClassError::ParentNotConstructible(
                parent.name().unwrap_or("<anonymous>").to_string(),
            ));
        }
    }
    if let Some(property) = definition
        .properties
        .iter()
        .find(|p| p.getter.is_none() && p.setter.is_none())
    {
        return Err(ClassError::EmptyProperty(property.name.clone()));
    }
    Ok(())
}

/// Compiles `definition` into a template chained to `parent`.
///
/// Either the whole class is built or nothing is: on failure the partial
/// template is discarded. Member registrations made before a failure stay in
/// the table unreferenced.
pub fn compile(
    engine: &dyn Engine,
    tables: &CallbackTables,
    definition: ClassDefinition,
    parent: Option<&JsClass>,
) -> Result<JsClass, ClassError> {
    validate(&definition, parent)?;

    let class_name = definition.display_name().to_string();
    let ClassDefinition {
        name,
        constructor,
        finalizer,
        properties,
        methods,
    } = definition;

    let constructible = constructor.is_some();
    let constructor_data = constructor.map(|ctor| {
        tables.register_member(MemberEntry::Constructor {
            function: ctor.function,
            flags: ctor.flags,
            finalizer: finalizer.clone(),
        })
    });

    let template = engine
        .new_template(TemplateDesc {
            class_name: name.clone(),
            constructor: constructor_data,
            parent: parent.map(|p| p.template),
            internal_field_count: INTERNAL_FIELD_COUNT,
        })
        .ok_or_else(|| ClassError::TemplateCreation(class_name.clone()))?;

    let installed = install_members(engine, tables, template, properties, methods);
    if let Err(member) = installed {
        engine.discard_template(template);
        log::error!("class '{}': failed to install member '{}'", class_name, member);
        return Err(ClassError::MemberInstallation {
            class: class_name,
            member,
        });
    }

    log::debug!("compiled class '{}' as {:?}", class_name, template);
    Ok(Rc::new(CompiledClass {
        name,
        template,
        constructible,
        finalizer,
        parent: parent.cloned(),
    }))
}

fn install_members(
    engine: &dyn Engine,
    tables: &CallbackTables,
    template: TemplateId,
    properties: Vec<PropertyDefinition>,
    methods: Vec<MethodDefinition>,
) -> Result<(), String> {
    for property in properties {
        let has_getter = property.getter.is_some();
        let has_setter = property.setter.is_some();
        let name = property.name;
        let data = tables.register_member(MemberEntry::Property {
            name: name.clone(),
            getter: property.getter,
            setter: property.setter,
            flags: property.flags,
        });
        let getter = has_getter.then_some(data);
        let setter = has_setter.then_some(data);
        if !engine.template_add_accessor(template, &name, getter, setter) {
            return Err(name);
        }
    }

    for method in methods {
        let data = tables.register_member(MemberEntry::Method(FunctionEntry {
            function: method.function,
            flags: method.flags,
            owner: None,
        }));
        if !engine.template_add_method(template, &method.name, data) {
            return Err(method.name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_empty_property() {
        let def = ClassDefinition::new("Bad").property("p", None, None, 0);
        assert_eq!(validate(&def, None), Err(ClassError::EmptyProperty("p".into())));
    }

    #[test]
    fn test_builder_collects_members() {
        let getter: PropertyGetter = Rc::new(|_, _| None);
        let def = ClassDefinition::new("Point")
            .constructor(0, |_, _, _| None)
            .property("x", Some(getter), None, 0)
            .method("norm", 0, |_, _, _| None)
            .finalizer(|_, _| {});
        assert_eq!(def.name.as_deref(), Some("Point"));
        assert!(def.constructor.is_some());
        assert_eq!(def.properties.len(), 1);
        assert_eq!(def.methods.len(), 1);
        assert!(def.finalizer.is_some());
        assert!(validate(&def, None).is_ok());
    }
}
