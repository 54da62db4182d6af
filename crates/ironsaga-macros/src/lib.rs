//! Procedural macros for the ironsaga runtime.
//!
//! # HasInstanceId Derive Macro
//!
//! Implements `HasInstanceId` for message enums routed with a direct mapper.
//!
//! ## Usage
//!
//! ```ignore
//! #[derive(Deserialize, HasInstanceId)]
//! #[serde(tag = "type")]
//! #[instance_id(order_id)]  // default field name for all variants
//! enum OrderMessage {
//!     OrderPlaced { order_id: String, items: Vec<Item> },
//!     PaymentReceived { order_id: Uuid },
//!     #[instance_id(reference)]  // override for this variant
//!     RefundIssued { reference: String },
//! }
//! ```
//!
//! The field may be of any type implementing `Display`.

use proc_macro::TokenStream;
use quote::quote;
use syn::{
    Attribute, Data, DeriveInput, Fields, Ident, Variant, parse_macro_input, spanned::Spanned,
};

/// Derives `HasInstanceId` for an enum.
///
/// Use `#[instance_id(field_name)]` on the enum to set the default field,
/// and optionally on individual variants to override.
#[proc_macro_derive(HasInstanceId, attributes(instance_id))]
pub fn derive_has_instance_id(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match derive_has_instance_id_impl(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn derive_has_instance_id_impl(input: DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let default_field = instance_id_attr(&input.attrs)?;

    let Data::Enum(data) = &input.data else {
        return Err(syn::Error::new(
            input.span(),
            "HasInstanceId can only be derived for enums",
        ));
    };

    let arms = data
        .variants
        .iter()
        .map(|variant| {
            let field = variant_field(variant, default_field.as_ref())?;
            match_arm(name, variant, &field)
        })
        .collect::<syn::Result<Vec<_>>>()?;

    Ok(quote! {
        impl #impl_generics ::ironsaga::HasInstanceId for #name #ty_generics #where_clause {
            fn instance_id(&self) -> ::ironsaga::InstanceId {
                match self {
                    #(#arms)*
                }
            }
        }
    })
}

/// Extract the field name from an `#[instance_id(field_name)]` attribute.
fn instance_id_attr(attrs: &[Attribute]) -> syn::Result<Option<Ident>> {
    attrs
        .iter()
        .find(|attr| attr.path().is_ident("instance_id"))
        .map(|attr| attr.parse_args())
        .transpose()
}

fn variant_field(variant: &Variant, default_field: Option<&Ident>) -> syn::Result<Ident> {
    if let Some(field) = instance_id_attr(&variant.attrs)? {
        return Ok(field);
    }

    default_field.cloned().ok_or_else(|| {
        syn::Error::new(
            variant.span(),
            format!(
                "Variant `{}` has no #[instance_id(field)] attribute and the enum sets no default",
                variant.ident
            ),
        )
    })
}

fn match_arm(
    enum_name: &Ident,
    variant: &Variant,
    field_name: &Ident,
) -> syn::Result<proc_macro2::TokenStream> {
    let variant_name = &variant.ident;

    let Fields::Named(fields) = &variant.fields else {
        return Err(syn::Error::new(
            variant.span(),
            "HasInstanceId derive only supports variants with named fields",
        ));
    };

    if !fields
        .named
        .iter()
        .any(|f| f.ident.as_ref() == Some(field_name))
    {
        let available = fields
            .named
            .iter()
            .filter_map(|f| f.ident.as_ref())
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(syn::Error::new(
            variant.span(),
            format!(
                "Field `{field_name}` not found in variant `{variant_name}`. \
                 Available fields: {available}"
            ),
        ));
    }

    Ok(quote! {
        #enum_name::#variant_name { #field_name, .. } => {
            ::ironsaga::InstanceId::new(::std::string::ToString::to_string(#field_name))
        }
    })
}
