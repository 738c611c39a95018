use proc_macro::TokenStream;
use quote::quote;
use syn::{DeriveInput, LitStr};

pub fn derive_bus_event(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as DeriveInput);

    match expand(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => TokenStream::from(err.to_compile_error()),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let mut topic: Option<LitStr> = None;
    let mut event_name: Option<LitStr> = None;

    // Extract #[bus_event(topic = "...", name = "...")]
    for attr in &input.attrs {
        if !attr.path().is_ident("bus_event") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("topic") {
                topic = Some(meta.value()?.parse()?);
                Ok(())
            } else if meta.path.is_ident("name") {
                event_name = Some(meta.value()?.parse()?);
                Ok(())
            } else {
                Err(meta.error("expected `topic` or `name`"))
            }
        })?;
    }

    let topic = topic.ok_or_else(|| {
        syn::Error::new_spanned(
            name,
            "BusEvent derive: missing #[bus_event(topic = \"...\")]",
        )
    })?;
    check_topic(&topic)?;

    let event_name = event_name.map(|n| n.value()).unwrap_or_else(|| name.to_string());

    Ok(quote! {
        impl #impl_generics ::topic_bus::BusEvent for #name #ty_generics #where_clause {
            const TOPIC: &'static str = #topic;
            const NAME: &'static str = #event_name;
        }
    })
}

fn check_topic(topic: &LitStr) -> syn::Result<()> {
    let value = topic.value();
    if value.is_empty() {
        return Err(syn::Error::new_spanned(topic, "topic must not be empty"));
    }
    for segment in value.split('.') {
        if segment.is_empty() {
            return Err(syn::Error::new_spanned(topic, "topic contains an empty segment"));
        }
        if segment.contains('*') {
            return Err(syn::Error::new_spanned(
                topic,
                "topic is a routing key and cannot contain `*`",
            ));
        }
    }
    Ok(())
}
