use proc_macro_error2::abort;
use proc_macro2::{Span, TokenStream};
use quote::quote;
use syn::ext::IdentExt;
use syn::{Data, DeriveInput, Fields, LitStr, spanned::Spanned};

/// Configuration parsed from a field's `#[entity(...)]` attributes
#[derive(Default)]
struct FieldConfig {
    ignore: Option<Span>,
    skip_null: Option<Span>,
    skip: Option<Span>,
    rename: Option<String>,
    read_only: bool,
    key: bool,
}

struct EntityField {
    ident: syn::Ident,
    ty: syn::Type,
    config: FieldConfig,
}

#[allow(clippy::needless_pass_by_value)] // DeriveInput is consumed by proc-macro pattern
pub fn expand_derive_entity(input: DeriveInput) -> TokenStream {
    let Data::Struct(data) = &input.data else {
        abort!(
            input.span(),
            "#[derive(Entity)] can only be applied to structs"
        );
    };
    let Fields::Named(named) = &data.fields else {
        abort!(
            input.span(),
            "#[derive(Entity)] requires a struct with named fields"
        );
    };
    if !input.generics.params.is_empty() {
        abort!(
            input.generics.span(),
            "#[derive(Entity)] does not support generic structs"
        );
    }

    let ident = &input.ident;
    let name = parse_struct_name(&input).unwrap_or_else(|| ident.to_string());

    let fields: Vec<EntityField> = named
        .named
        .iter()
        .filter_map(|field| {
            let ident = field.ident.clone()?;
            let config = parse_field_attrs(field);
            config.skip.is_none().then(|| EntityField {
                ident,
                ty: field.ty.clone(),
                config,
            })
        })
        .collect();

    let properties = fields.iter().map(describe_property);
    let getters = fields.iter().map(|field| {
        let ident = &field.ident;
        let property = property_name(ident);
        quote! {
            #property => ::core::option::Option::Some(
                ::entity_access::value::ToValue::to_value(&self.#ident)
            ),
        }
    });

    quote! {
        impl ::entity_access::value::Record for #ident {
            fn type_name(&self) -> &'static str {
                <Self as ::entity_access::value::Entity>::NAME
            }

            fn qualified_type_name(&self) -> &'static str {
                ::core::any::type_name::<Self>()
            }

            fn entity_type(&self) -> ::core::option::Option<::entity_access::value::EntityType> {
                ::core::option::Option::Some(::entity_access::value::EntityType::of::<Self>())
            }

            fn shape(
                &self,
                cache: &::entity_access::shape::ShapeCache,
            ) -> ::std::sync::Arc<::entity_access::shape::TypeShape> {
                cache.shape_of(::entity_access::value::EntityType::of::<Self>())
            }

            fn get(&self, property: &str) -> ::core::option::Option<::entity_access::value::Value> {
                match property {
                    #(#getters)*
                    _ => ::core::option::Option::None,
                }
            }

            fn as_any(&self) -> &dyn ::core::any::Any {
                self
            }
        }

        impl ::entity_access::value::Entity for #ident {
            const NAME: &'static str = #name;

            fn describe() -> ::entity_access::shape::TypeShape {
                ::entity_access::shape::TypeShape::new(#name)
                    #(#properties)*
            }
        }
    }
}

/// Generate the `.property(...)` call registering one field in the type shape
fn describe_property(field: &EntityField) -> TokenStream {
    let name = property_name(&field.ident);
    let ty = &field.ty;
    let config = &field.config;

    let ignore = if config.ignore.is_some() {
        Some(quote! { .ignore(::entity_access::shape::IgnoreCondition::Always) })
    } else if config.skip_null.is_some() {
        Some(quote! { .ignore(::entity_access::shape::IgnoreCondition::WhenWritingNull) })
    } else {
        None
    };
    let rename = config.rename.as_ref().map(|wire| quote! { .rename(#wire) });
    let read_only = config.read_only.then(|| quote! { .read_only() });
    let key = config.key.then(|| quote! { .key() });

    quote! {
        .property(
            ::entity_access::shape::PropertyShape::new(
                #name,
                <#ty as ::entity_access::value::ToValue>::kind(),
            )
            #ignore
            #rename
            #read_only
            #key
        )
    }
}

/// Parse `#[entity(name = "...")]` on the struct
fn parse_struct_name(input: &DeriveInput) -> Option<String> {
    let mut name = None;
    for attr in &input.attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }
        let result = attr.parse_nested_meta(|meta| {
            let span = meta.path.span();
            if meta.path.is_ident("name") {
                if name.is_some() {
                    abort!(span, "duplicate attribute 'name'");
                }
                let value: LitStr = meta.value()?.parse()?;
                if value.value().is_empty() {
                    abort!(span, "entity name must not be empty");
                }
                name = Some(value.value());
                return Ok(());
            }
            abort!(span, "Unknown attribute. Valid struct attributes: name");
        });
        if let Err(err) = result {
            abort!(attr.span(), "{}", err);
        }
    }
    name
}

/// Parse all `#[entity(...)]` attributes of a field with conflict detection
fn parse_field_attrs(field: &syn::Field) -> FieldConfig {
    let mut config = FieldConfig::default();

    for attr in &field.attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }
        let result = attr.parse_nested_meta(|meta| {
            let span = meta.path.span();
            let key = meta
                .path
                .get_ident()
                .map(ToString::to_string)
                .unwrap_or_default();
            match key.as_str() {
                "ignore" => {
                    if config.skip_null.is_some() {
                        abort!(span, "entity: specify either `ignore` or `skip_null`, not both");
                    }
                    config.ignore = Some(span);
                }
                "skip_null" => {
                    if config.ignore.is_some() {
                        abort!(span, "entity: specify either `ignore` or `skip_null`, not both");
                    }
                    config.skip_null = Some(span);
                }
                "skip" => config.skip = Some(span),
                "read_only" => config.read_only = true,
                "key" => config.key = true,
                "rename" => {
                    if config.rename.is_some() {
                        abort!(span, "duplicate attribute 'rename'");
                    }
                    let value: LitStr = meta.value()?.parse()?;
                    config.rename = Some(value.value());
                }
                _ => abort!(
                    span,
                    "Unknown attribute '{}'. Valid field attributes: ignore, skip_null, skip, \
                     rename, read_only, key",
                    key
                ),
            }
            Ok(())
        });
        if let Err(err) = result {
            abort!(attr.span(), "{}", err);
        }
    }

    if let Some(span) = config.skip
        && (config.ignore.is_some()
            || config.skip_null.is_some()
            || config.rename.is_some()
            || config.read_only
            || config.key)
    {
        abort!(span, "entity: `skip` cannot be combined with other field attributes");
    }
    config
}

#[allow(clippy::needless_pass_by_value)] // DeriveInput is consumed by proc-macro pattern
pub fn expand_derive_entity_enum(input: DeriveInput) -> TokenStream {
    let Data::Enum(data) = &input.data else {
        abort!(
            input.span(),
            "#[derive(EntityEnum)] can only be applied to enums"
        );
    };
    if data.variants.is_empty() {
        abort!(
            input.span(),
            "#[derive(EntityEnum)] requires at least one variant"
        );
    }

    let ident = &input.ident;
    let arms = data.variants.iter().map(|variant| {
        if !matches!(variant.fields, Fields::Unit) {
            abort!(
                variant.span(),
                "#[derive(EntityEnum)] supports unit variants only"
            );
        }
        let variant_ident = &variant.ident;
        let name = parse_variant_rename(variant).unwrap_or_else(|| variant_ident.to_string());
        quote! { Self::#variant_ident => #name, }
    });

    quote! {
        impl ::entity_access::value::ToValue for #ident {
            fn kind() -> ::entity_access::shape::PropertyKind {
                ::entity_access::shape::PropertyKind::Scalar(
                    ::entity_access::shape::ScalarKind::Enum,
                )
            }

            fn to_value(&self) -> ::entity_access::value::Value {
                ::entity_access::value::Value::Enum(match self {
                    #(#arms)*
                })
            }
        }

        impl ::core::convert::From<#ident> for ::entity_access::value::Value {
            fn from(value: #ident) -> Self {
                ::entity_access::value::ToValue::to_value(&value)
            }
        }

        impl ::core::convert::From<#ident> for ::entity_access::expr::Expr {
            fn from(value: #ident) -> Self {
                ::entity_access::expr::Expr::Constant(
                    ::entity_access::value::ToValue::to_value(&value),
                )
            }
        }
    }
}

/// Parse `#[entity(rename = "...")]` on an enum variant
fn parse_variant_rename(variant: &syn::Variant) -> Option<String> {
    let mut rename = None;
    for attr in &variant.attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }
        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename") {
                let value: LitStr = meta.value()?.parse()?;
                rename = Some(value.value());
                return Ok(());
            }
            abort!(
                meta.path.span(),
                "Unknown attribute. Valid variant attributes: rename"
            );
        });
        if let Err(err) = result {
            abort!(attr.span(), "{}", err);
        }
    }
    rename
}

/// Declared property name of a field, without a raw identifier prefix
fn property_name(ident: &syn::Ident) -> String {
    ident.unraw().to_string()
}
