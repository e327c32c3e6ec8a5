//! # Accessor Derive
//!
//! Derive macro generating builder-style setters for configuration structs.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{Attribute, Data, DeriveInput, Fields, LitBool, parse_macro_input, spanned::Spanned};

/// Derive to generate `.set_<field>(&mut self, value: Ty) -> &mut Self` and
/// `.with_<field>(mut self, value: Ty) -> Self` for each **named** field.
///
/// `with_*` is a `const fn` unless the field opts out. Fields whose type has
/// drop glue (`Arc`, `Option<Arc<_>>`, `Vec`, ...) must opt out, because a
/// `const fn` cannot drop the value it replaces.
///
/// - Skipping a field: `#[setters(skip)]`
/// - Non-const `with_*`: `#[setters(non_const)]`
///
/// # Example
///
/// ```
/// use utils_accessors_derive::Setters;
///
/// #[derive(Setters)]
/// struct Config {
///     ias: u32,
///     #[setters(non_const)]
///     label: String,
///     #[setters(skip)]
///     _reserved: (),
/// }
///
/// let mut c = Config { ias: 40, label: String::new(), _reserved: () };
/// c.set_ias(44).set_ias(48);
/// let c = c.with_label("uat".into());
/// assert_eq!(c.ias, 48);
/// assert_eq!(c.label, "uat");
/// ```
#[proc_macro_derive(Setters, attributes(setters))]
pub fn derive_generate_setters(input: TokenStream) -> TokenStream {
    let DeriveInput {
        ident,
        generics,
        data,
        ..
    } = parse_macro_input!(input as DeriveInput);

    let fields = match data {
        Data::Struct(s) => match s.fields {
            Fields::Named(n) => n.named,
            Fields::Unnamed(u) => {
                return syn::Error::new(u.span(), "Setters only supports named fields")
                    .to_compile_error()
                    .into();
            }
            Fields::Unit => {
                return syn::Error::new(ident.span(), "Setters does not apply to unit structs")
                    .to_compile_error()
                    .into();
            }
        },
        _ => {
            return syn::Error::new(ident.span(), "Setters can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let mut methods = Vec::new();

    for field in fields {
        let Some(fname) = &field.ident else { continue };
        let options = match FieldOptions::parse(&field.attrs) {
            Ok(options) => options,
            Err(e) => return e.to_compile_error().into(),
        };
        if options.skip {
            continue;
        }

        let ty = &field.ty;
        let set_name = format_ident!("set_{}", fname);
        let with_name = format_ident!("with_{}", fname);
        let constness = if options.non_const {
            quote! {}
        } else {
            quote! { const }
        };

        methods.push(quote! {
            #[inline]
            pub fn #set_name(&mut self, value: #ty) -> &mut Self {
                self.#fname = value;
                self
            }

            #[inline]
            #[must_use]
            pub #constness fn #with_name(mut self, value: #ty) -> Self {
                self.#fname = value;
                self
            }
        });
    }

    let expanded = quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    };

    TokenStream::from(expanded)
}

/// Per-field `#[setters(...)]` options.
#[derive(Default)]
struct FieldOptions {
    skip: bool,
    non_const: bool,
}

impl FieldOptions {
    /// Accepts `skip`, `skip = <bool>`, `non_const` and `non_const = <bool>`.
    fn parse(attrs: &[Attribute]) -> syn::Result<Self> {
        let mut options = Self::default();
        for attr in attrs {
            if !attr.path().is_ident("setters") {
                continue;
            }

            attr.parse_nested_meta(|meta| {
                let flag = if meta.path.is_ident("skip") {
                    &mut options.skip
                } else if meta.path.is_ident("non_const") {
                    &mut options.non_const
                } else {
                    return Err(meta.error("expected `skip` or `non_const`"));
                };

                *flag = if meta.input.is_empty() {
                    true
                } else {
                    meta.value()?.parse::<LitBool>()?.value
                };
                Ok(())
            })?;
        }
        Ok(options)
    }
}
